//! Kernel program types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Kernel hook category of a program.
///
/// Numeric codes are the kernel's `bpf_prog_type` values, which is what the
/// daemon persists and reports. Uprobes are loaded as kprobe programs, so
/// `Uprobe` and `Kprobe` share a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramType {
    Unspec,
    SocketFilter,
    Kprobe,
    Uprobe,
    Tc,
    SchedAct,
    Tracepoint,
    Xdp,
    PerfEvent,
    CgroupSkb,
    CgroupSock,
    LwtIn,
    LwtOut,
    LwtXmit,
    SockOps,
    SkSkb,
    CgroupDevice,
    SkMsg,
    RawTracepoint,
    CgroupSockAddr,
    LwtSeg6Local,
    LircMode2,
    SkReuseport,
    FlowDissector,
    CgroupSysctl,
    RawTracepointWritable,
    CgroupSockopt,
    Tracing,
    StructOps,
    Ext,
    Lsm,
    SkLookup,
    Syscall,
}

impl ProgramType {
    /// Every program type, in kernel code order.
    pub const ALL: [Self; 33] = [
        Self::Unspec,
        Self::SocketFilter,
        Self::Kprobe,
        Self::Uprobe,
        Self::Tc,
        Self::SchedAct,
        Self::Tracepoint,
        Self::Xdp,
        Self::PerfEvent,
        Self::CgroupSkb,
        Self::CgroupSock,
        Self::LwtIn,
        Self::LwtOut,
        Self::LwtXmit,
        Self::SockOps,
        Self::SkSkb,
        Self::CgroupDevice,
        Self::SkMsg,
        Self::RawTracepoint,
        Self::CgroupSockAddr,
        Self::LwtSeg6Local,
        Self::LircMode2,
        Self::SkReuseport,
        Self::FlowDissector,
        Self::CgroupSysctl,
        Self::RawTracepointWritable,
        Self::CgroupSockopt,
        Self::Tracing,
        Self::StructOps,
        Self::Ext,
        Self::Lsm,
        Self::SkLookup,
        Self::Syscall,
    ];

    /// Kernel `bpf_prog_type` code sent over the wire.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Unspec => 0,
            Self::SocketFilter => 1,
            Self::Kprobe | Self::Uprobe => 2,
            Self::Tc => 3,
            Self::SchedAct => 4,
            Self::Tracepoint => 5,
            Self::Xdp => 6,
            Self::PerfEvent => 7,
            Self::CgroupSkb => 8,
            Self::CgroupSock => 9,
            Self::LwtIn => 10,
            Self::LwtOut => 11,
            Self::LwtXmit => 12,
            Self::SockOps => 13,
            Self::SkSkb => 14,
            Self::CgroupDevice => 15,
            Self::SkMsg => 16,
            Self::RawTracepoint => 17,
            Self::CgroupSockAddr => 18,
            Self::LwtSeg6Local => 19,
            Self::LircMode2 => 20,
            Self::SkReuseport => 21,
            Self::FlowDissector => 22,
            Self::CgroupSysctl => 23,
            Self::RawTracepointWritable => 24,
            Self::CgroupSockopt => 25,
            Self::Tracing => 26,
            Self::StructOps => 27,
            Self::Ext => 28,
            Self::Lsm => 29,
            Self::SkLookup => 30,
            Self::Syscall => 31,
        }
    }

    /// Decode a kernel code. Code 2 decodes to `Kprobe`.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspec => "unspec",
            Self::SocketFilter => "socket_filter",
            Self::Kprobe => "kprobe",
            Self::Uprobe => "uprobe",
            Self::Tc => "tc",
            Self::SchedAct => "sched_act",
            Self::Tracepoint => "tracepoint",
            Self::Xdp => "xdp",
            Self::PerfEvent => "perf_event",
            Self::CgroupSkb => "cgroup_skb",
            Self::CgroupSock => "cgroup_sock",
            Self::LwtIn => "lwt_in",
            Self::LwtOut => "lwt_out",
            Self::LwtXmit => "lwt_xmit",
            Self::SockOps => "sock_ops",
            Self::SkSkb => "sk_skb",
            Self::CgroupDevice => "cgroup_device",
            Self::SkMsg => "sk_msg",
            Self::RawTracepoint => "raw_tracepoint",
            Self::CgroupSockAddr => "cgroup_sock_addr",
            Self::LwtSeg6Local => "lwt_seg6local",
            Self::LircMode2 => "lirc_mode2",
            Self::SkReuseport => "sk_reuseport",
            Self::FlowDissector => "flow_dissector",
            Self::CgroupSysctl => "cgroup_sysctl",
            Self::RawTracepointWritable => "raw_tracepoint_writable",
            Self::CgroupSockopt => "cgroup_sockopt",
            Self::Tracing => "tracing",
            Self::StructOps => "struct_ops",
            Self::Ext => "ext",
            Self::Lsm => "lsm",
            Self::SkLookup => "sk_lookup",
            Self::Syscall => "syscall",
        }
    }
}

impl fmt::Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgramType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| Error::UnknownProgramType {
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uprobe_shares_kprobe_code() {
        assert_eq!(ProgramType::Uprobe.code(), ProgramType::Kprobe.code());
        assert_eq!(ProgramType::from_code(2), Some(ProgramType::Kprobe));
    }

    #[test]
    fn test_from_code_unknown() {
        assert_eq!(ProgramType::from_code(99), None);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("XDP".parse::<ProgramType>(), Ok(ProgramType::Xdp));
        assert_eq!("tc".parse::<ProgramType>(), Ok(ProgramType::Tc));
        assert!("nope".parse::<ProgramType>().is_err());
    }

    #[test]
    fn test_codes_round_trip_except_uprobe() {
        for t in ProgramType::ALL {
            let decoded = ProgramType::from_code(t.code());
            if t == ProgramType::Uprobe {
                assert_eq!(decoded, Some(ProgramType::Kprobe));
            } else {
                assert_eq!(decoded, Some(t));
            }
        }
    }
}
