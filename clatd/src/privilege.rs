//! The privilege gate: a partial drop from `root` to the unprivileged
//! `clat` user, retaining exactly the capabilities the event loop needs to
//! keep operating the tunnel and the packet ring.
//!
//! Any failed step is fatal and aborts before the daemon touches the
//! network; a final check confirms root privileges cannot be regained.

use caps::{CapSet, Capability, CapsHashSet};
use nix::unistd::{Gid, Group, Uid, User};

use crate::error::DaemonError;

/// Capabilities retained across the UID switch.
const RETAINED: [Capability; 3] = [
    Capability::CAP_NET_ADMIN,
    Capability::CAP_NET_RAW,
    Capability::CAP_IPC_LOCK,
];

/// Supplementary groups the `clat` user is switched into.
const SUPPLEMENTARY_GROUPS: [&str; 2] = ["inet", "vpn"];

/// Drops from `root` to the `clat` user, retaining [`RETAINED`].
///
/// Any failure along the way is fatal: the caller must exit before
/// touching the network.
pub fn drop_to_clat_user() -> Result<(), DaemonError> {
    let user = User::from_name("clat")
        .map_err(|e| DaemonError::Privilege(format!("cannot look up `clat` user: {e}")))?
        .ok_or_else(|| DaemonError::Privilege("no `clat` user on this system".to_string()))?;

    let groups = resolve_supplementary_groups()?;

    // Step 1: supplementary groups.
    nix::unistd::setgroups(&groups)
        .map_err(|e| DaemonError::Privilege(format!("setgroups failed: {e}")))?;

    // Step 2: keep capabilities across the UID change.
    set_keepcaps(true)?;

    // Step 3: real, effective, and saved GID, then UID.
    nix::unistd::setresgid(user.gid, user.gid, user.gid)
        .map_err(|e| DaemonError::Privilege(format!("setresgid failed: {e}")))?;
    nix::unistd::setresuid(user.uid, user.uid, user.uid)
        .map_err(|e| DaemonError::Privilege(format!("setresuid failed: {e}")))?;

    // Step 4: restrict permitted/effective/inheritable capabilities.
    restrict_capabilities()?;

    if can_regain_root() {
        return Err(DaemonError::Privilege(
            "process can still regain root after dropping privileges".to_string(),
        ));
    }

    Ok(())
}

fn resolve_supplementary_groups() -> Result<Vec<Gid>, DaemonError> {
    SUPPLEMENTARY_GROUPS
        .iter()
        .map(|name| {
            Group::from_name(name)
                .map_err(|e| DaemonError::Privilege(format!("cannot look up group {name:?}: {e}")))?
                .map(|g| g.gid)
                .ok_or_else(|| DaemonError::Privilege(format!("no {name:?} group on this system")))
        })
        .collect()
}

fn set_keepcaps(keep: bool) -> Result<(), DaemonError> {
    let ret = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, keep as libc::c_ulong, 0, 0, 0) };
    if ret != 0 {
        return Err(DaemonError::Privilege(format!(
            "prctl(PR_SET_KEEPCAPS) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn restrict_capabilities() -> Result<(), DaemonError> {
    let mut set = CapsHashSet::new();
    set.extend(RETAINED);

    for cap_set in [CapSet::Permitted, CapSet::Effective, CapSet::Inheritable] {
        caps::set(None, cap_set, &set)
            .map_err(|e| DaemonError::Privilege(format!("caps::set({cap_set:?}) failed: {e}")))?;
    }

    Ok(())
}

fn can_regain_root() -> bool {
    Uid::current().is_root()
        || nix::unistd::setuid(Uid::from_raw(0)).is_ok()
        || nix::unistd::setgid(Gid::from_raw(0)).is_ok()
}

/// Returns `true` if the current process has either `root` or
/// `CAP_NET_ADMIN`, mirroring `gateway`'s preflight check — used to fail
/// fast with a clear message before attempting the full privilege-drop
/// sequence.
pub fn has_necessary_permissions() -> bool {
    let is_root = Uid::current().is_root();
    let has_net_admin =
        caps::has_cap(None, CapSet::Effective, Capability::CAP_NET_ADMIN).unwrap_or(false);

    is_root || has_net_admin
}
