//! Privilege drop after baseline finalization.
//!
//! Counters are opened once at startup and do not need elevation to keep
//! reading afterward, so as soon as learning finishes the process drops
//! back to the invoking user's identity if it was started via a
//! sudo-like wrapper. Best-effort: a failure here is logged, never
//! fatal — the detector keeps running elevated rather than crash.

use std::env;

/// Reads `SUDO_UID`/`SUDO_GID` once and, if present, drops to that
/// identity. No-op if the variables are absent (not launched via sudo)
/// or the process is not actually running as root.
pub fn drop_if_elevated() {
    if !is_root() {
        return;
    }

    let Some(uid) = env_uid("SUDO_UID") else {
        return;
    };
    let gid = env_uid("SUDO_GID").unwrap_or(uid);

    // Drop supplementary groups first — with root, an empty group list
    // is always permitted and leaves no leaked group membership behind.
    if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
        log::warn!(
            "privilege drop: setgroups(0) failed: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    if unsafe { libc::setgid(gid) } != 0 {
        log::warn!(
            "privilege drop: setgid({gid}) failed: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    if unsafe { libc::setuid(uid) } != 0 {
        log::warn!(
            "privilege drop: setuid({uid}) failed: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    log::info!("dropped privileges to uid={uid} gid={gid} after baseline finalization");
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn env_uid(var: &str) -> Option<libc::uid_t> {
    env::var(var).ok()?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_uid_parses_valid_values_and_rejects_garbage() {
        std::env::set_var("CACHEGUARD_TEST_UID", "1000");
        assert_eq!(env_uid("CACHEGUARD_TEST_UID"), Some(1000));
        std::env::set_var("CACHEGUARD_TEST_UID", "not-a-uid");
        assert_eq!(env_uid("CACHEGUARD_TEST_UID"), None);
        std::env::remove_var("CACHEGUARD_TEST_UID");
    }
}
