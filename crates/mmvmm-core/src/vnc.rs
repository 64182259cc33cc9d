//! VNC display allocation (spec.md §4.2).
//!
//! Deliberately trivial: the display number is the VM id, so there is
//! nothing to track and nothing that can leak. QEMU is told `-vnc :N`.

/// Returns the VNC display number QEMU should bind for `vm_id`.
pub fn display_for(vm_id: i64) -> u32 {
    vm_id as u32
}

/// Returns the `-vnc` argument value QEMU expects (`:N`).
pub fn vnc_arg(vm_id: i64) -> String {
    format!(":{}", display_for(vm_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_vm_id() {
        assert_eq!(display_for(1), 1);
        assert_eq!(display_for(42), 42);
    }

    #[test]
    fn arg_is_colon_prefixed() {
        assert_eq!(vnc_arg(5), ":5");
    }
}
