//! Writer example: create a keyed segment and publish data into it

use shmemu::{AttachFlags, ShmGetFlags, ShmResult, shm_attach, shm_detach, shm_get, shm_stat};
use std::io;

const EXAMPLE_KEY: libc::key_t = 0x0042;

fn main() -> ShmResult<()> {
    shmemu::init_tracing();

    println!("SysV Shared Memory Writer Example");
    println!("=================================");

    println!("Creating segment for key {EXAMPLE_KEY:#x}...");
    let id = shm_get(EXAMPLE_KEY, 4096, ShmGetFlags::CREATE)?;
    let stat = shm_stat(id)?;

    println!("✓ Segment ready!");
    println!("  Segment id: {id}");
    println!("  Size: {} bytes", stat.size);

    let addr = shm_attach(id, AttachFlags::empty())?;
    println!("✓ Attached at {addr:?}");

    let message = b"Hello from the writer process!";
    // SAFETY: addr maps at least stat.size bytes and message fits.
    unsafe {
        std::ptr::copy_nonoverlapping(message.as_ptr(), addr, message.len());
        addr.add(message.len()).write(0);
    }
    println!("✓ Wrote {} bytes", message.len());

    println!("\nRun the sysv_reader example from another terminal.");
    println!("Press Enter to exit (this keeps the segment alive until then)...");
    let mut input = String::new();
    io::stdin().read_line(&mut input).ok();

    shm_detach(addr)?;
    Ok(())
}
