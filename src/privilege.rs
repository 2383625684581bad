// Raw-socket capture needs root (or CAP_NET_RAW); fail early with a usable
// message instead of an opaque EPERM from socket(2).

use crate::error::WatchError;

pub fn check_root() -> Result<(), WatchError> {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(WatchError::InsufficientPermission(
            "dnswatch requires root privileges to open a capture socket (try sudo)".to_string(),
        ));
    }
    Ok(())
}
