use std::path::PathBuf;

use eyre_pretty::{Result, bail};
use opal::system::{gbi, mem::Rdram};

use crate::capture::Capture;

/// Prints `count` commands starting at `address`, or at the first task's display list.
pub fn disasm(input: PathBuf, address: Option<u32>, count: u32) -> Result<()> {
    let capture = Capture::open(&input)?;
    let dialect = capture.dialect()?;

    let Some(mut pc) = address.or_else(|| capture.entries.first().copied()) else {
        bail!("capture has no tasks and no address was given");
    };

    let mem = Rdram::from_bytes(capture.rdram);
    println!("{dialect} display list at {pc:#08X}");

    for _ in 0..count {
        let Ok(decoded) = gbi::decode(dialect, &mem, pc) else {
            println!("{pc:08X}: <outside of rdram>");
            break;
        };

        println!(
            "{pc:08X}: {:08X} {:08X}  {:?}",
            decoded.w0, decoded.w1, decoded.command
        );

        if decoded.command == gbi::Command::EndDisplayList {
            break;
        }

        pc = pc.wrapping_add(decoded.length);
    }

    Ok(())
}
