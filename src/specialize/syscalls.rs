//! Syscall names usable in filter profiles. Only calls that exist on every
//! supported architecture are listed, so profiles stay portable.

macro_rules! syscall_table {
    ($($name:ident),* $(,)?) => {
        pub const SYSCALLS: &[(&str, i64)] = &[
            $((stringify!($name), libc::$name as i64),)*
        ];
    };
}

syscall_table! {
    SYS_acct,
    SYS_add_key,
    SYS_bpf,
    SYS_clock_adjtime,
    SYS_clock_settime,
    SYS_delete_module,
    SYS_finit_module,
    SYS_init_module,
    SYS_kexec_load,
    SYS_keyctl,
    SYS_lookup_dcookie,
    SYS_mount,
    SYS_perf_event_open,
    SYS_personality,
    SYS_pivot_root,
    SYS_process_vm_readv,
    SYS_process_vm_writev,
    SYS_ptrace,
    SYS_quotactl,
    SYS_reboot,
    SYS_request_key,
    SYS_setdomainname,
    SYS_setfsgid,
    SYS_setfsuid,
    SYS_setgid,
    SYS_setgroups,
    SYS_sethostname,
    SYS_setns,
    SYS_setregid,
    SYS_setresgid,
    SYS_setresuid,
    SYS_setreuid,
    SYS_settimeofday,
    SYS_setuid,
    SYS_swapoff,
    SYS_swapon,
    SYS_umount2,
    SYS_unshare,
    SYS_userfaultfd,
    SYS_vhangup,
}

pub fn lookup(name: &str) -> Option<i64> {
    let key = name.strip_prefix("SYS_").unwrap_or(name);
    SYSCALLS
        .iter()
        .find(|(n, _)| n.strip_prefix("SYS_") == Some(key))
        .map(|(_, nr)| *nr)
}
