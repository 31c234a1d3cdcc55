use std::io;

/// Claim this process's single tracer slot so no debugger can attach for
/// the rest of its life. Fails when something is already tracing us.
#[cfg(target_os = "linux")]
pub fn deny_debuggers() -> io::Result<()> {
    // SAFETY: PTRACE_TRACEME takes no other arguments; the pid, addr and
    // data words are ignored.
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_TRACEME,
            0,
            std::ptr::null_mut::<libc::c_char>(),
            0,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    log::debug!("tracer slot claimed, debuggers locked out");
    Ok(())
}

/// No tracer lockout available on this platform.
#[cfg(not(target_os = "linux"))]
pub fn deny_debuggers() -> io::Result<()> {
    Ok(())
}
