//! Reader example: join the writer's segment by key and read its data

use shmemu::{AttachFlags, ShmGetFlags, ShmResult, shm_attach, shm_detach, shm_get, shm_stat};

const EXAMPLE_KEY: libc::key_t = 0x0042;

fn main() -> ShmResult<()> {
    shmemu::init_tracing();

    println!("SysV Shared Memory Reader Example");
    println!("=================================");

    println!("Looking up segment for key {EXAMPLE_KEY:#x}...");
    let id = shm_get(EXAMPLE_KEY, 4096, ShmGetFlags::empty())?;
    let stat = shm_stat(id)?;

    println!("✓ Joined segment {id} ({} bytes)", stat.size);

    let addr = shm_attach(id, AttachFlags::READ_ONLY)?;
    println!("✓ Attached read-only at {addr:?}");

    // SAFETY: the mapping covers stat.size bytes; the writer NUL-terminates.
    let text = unsafe {
        std::ffi::CStr::from_ptr(addr.cast())
            .to_string_lossy()
            .into_owned()
    };
    println!("Read: {text:?}");

    shm_detach(addr)?;
    Ok(())
}
