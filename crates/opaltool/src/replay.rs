use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Instant,
};

use comfy_table::{
    Cell, CellAlignment, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_FULL,
};
use eyre_pretty::{Context, Result, eyre};
use opal::{
    config::Config,
    modules::render::{Action, RenderModule},
};
use tracing::info;

use crate::capture::Capture;

/// A render module which only counts the actions it receives.
#[derive(Debug, Default)]
struct Tally {
    actions: BTreeMap<&'static str, u64>,
    primitives: u64,
}

impl RenderModule for Tally {
    fn exec(&mut self, action: Action) {
        let (name, primitives) = match &action {
            Action::CreateTarget { .. } => ("create target", 0),
            Action::DeleteTarget(_) => ("delete target", 0),
            Action::CreateDepth { .. } => ("create depth", 0),
            Action::DeleteDepth(_) => ("delete depth", 0),
            Action::AttachDepth { .. } => ("attach depth", 0),
            Action::BindTarget(_) => ("bind target", 0),
            Action::ClearColor { .. } => ("clear color", 0),
            Action::ClearDepth { .. } => ("clear depth", 0),
            Action::DrawTriangles(draw) => ("draw triangles", draw.vertices.len() / 3),
            Action::DrawRects(draw) => ("draw rects", draw.quads.len()),
            Action::DrawLines(draw) => ("draw lines", draw.vertices.len() / 2),
            Action::UploadTexture { .. } => ("upload texture", 0),
            Action::DeleteTexture(_) => ("delete texture", 0),
            Action::UploadColor { .. } => ("upload color", 0),
            Action::Resolve(_) => ("resolve", 0),
            Action::CopyDepth(_) => ("copy depth", 0),
            // dropping the response leaves guest memory untouched
            Action::ReadColor { .. } => ("read color", 0),
            Action::ReadDepth { .. } => ("read depth", 0),
            Action::Present { .. } => ("present", 0),
        };

        *self.actions.entry(name).or_default() += 1;
        self.primitives += primitives as u64;
    }
}

/// Shares the tally with the core while still being readable afterwards.
struct Shared(Arc<Mutex<Tally>>);

impl RenderModule for Shared {
    fn exec(&mut self, action: Action) {
        if let Ok(mut tally) = self.0.lock() {
            tally.exec(action);
        }
    }
}

pub fn replay(input: PathBuf, frames: u32, config: Option<PathBuf>) -> Result<()> {
    let config = match config {
        Some(path) => Config::load(&path).context("loading config")?,
        None => Config::default(),
    };

    let capture = Capture::open(&input)?;
    let entries = capture.entries.clone();

    let tally = Arc::new(Mutex::new(Tally::default()));
    let mut opal = capture.load(config, Box::new(Shared(tally.clone())))?;

    let start = Instant::now();
    for frame in 0..frames {
        for &entry in &entries {
            opal.run_display_list(entry);
        }
        opal.update_screen();
        info!(frame, "frame done");
    }
    let elapsed = start.elapsed();

    let tally = tally.lock().map_err(|_| eyre!("render module panicked"))?;
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Action").set_alignment(CellAlignment::Center),
            Cell::new("Count").set_alignment(CellAlignment::Center),
        ]);

    for (name, count) in &tally.actions {
        table.add_row(vec![Cell::new(name), Cell::new(count).set_alignment(CellAlignment::Right)]);
    }

    println!("{table}");
    println!(
        "{frames} frame(s), {} task(s) each, {} primitives in {elapsed:.2?}",
        entries.len(),
        tally.primitives
    );

    Ok(())
}
