// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow counters as kept by the kernel module, and their extension into the
//! wider counters the agent keeps. The kernel keeps 32-bit byte and packet
//! counters with 16 and 8 overflow bits on top. The agent keeps 48 bits of
//! bytes and 40 bits of packets, plus overflow bits of its own for the times
//! the kernel counters wrap.

use bitflags::bitflags;

const AGENT_BYTES_MASK: u64 = 0x0000_ffff_ffff_ffff;
const AGENT_BYTES_OFLOW: u64 = 0x0001_0000_0000_0000;
const AGENT_PACKETS_MASK: u64 = 0x0000_00ff_ffff_ffff;
const AGENT_PACKETS_OFLOW: u64 = 0x0000_0100_0000_0000;

bitflags! {
    /// TCP state of a flow as tracked by the kernel
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u16 {
        const SYN           = 0x0001;
        const SYN_R         = 0x0002;
        const ESTABLISHED   = 0x0004;
        const ESTABLISHED_R = 0x0008;
        const FIN           = 0x0010;
        const FIN_R         = 0x0020;
        const HALF_CLOSE    = 0x0040;
        const RST           = 0x0080;
    }
}

/// Counters of one flow slot of the kernel flow table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelFlowStats {
    pub bytes: u32,
    pub bytes_oflow: u16,
    pub packets: u32,
    pub packets_oflow: u8,
    pub tcp_flags: TcpFlags,
    pub underlay_source_port: u16,
}

impl KernelFlowStats {
    /// The 48-bit byte count of the kernel
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        (u64::from(self.bytes_oflow) << 32) | u64::from(self.bytes)
    }
    /// The 40-bit packet count of the kernel
    #[must_use]
    pub fn total_packets(&self) -> u64 {
        (u64::from(self.packets_oflow) << 32) | u64::from(self.packets)
    }
}

/// Read access to the kernel flow table, by flow handle
pub trait KernelFlowSource: Send + Sync {
    fn flow_stats(&self, handle: u32) -> Option<KernelFlowStats>;
}

/// Byte count of the kernel bits of an agent counter
#[must_use]
pub fn kernel_bits_bytes(agent: u64) -> u64 {
    agent & AGENT_BYTES_MASK
}

/// Fold the kernel byte count into the agent counter, counting a wrap when
/// the kernel count went backwards.
#[must_use]
pub fn updated_bytes(agent: u64, kernel: u64) -> u64 {
    let mut oflow = agent & !AGENT_BYTES_MASK;
    if agent & AGENT_BYTES_MASK > kernel {
        oflow = oflow.wrapping_add(AGENT_BYTES_OFLOW);
    }
    oflow | (kernel & AGENT_BYTES_MASK)
}

/// Same as [`updated_bytes`], for packets
#[must_use]
pub fn updated_packets(agent: u64, kernel: u64) -> u64 {
    let mut oflow = agent & !AGENT_PACKETS_MASK;
    if agent & AGENT_PACKETS_MASK > kernel {
        oflow = oflow.wrapping_add(AGENT_PACKETS_OFLOW);
    }
    oflow | (kernel & AGENT_PACKETS_MASK)
}
