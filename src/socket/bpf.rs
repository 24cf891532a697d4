//! Classic BPF compiler for capture filters
//!
//! A tiny front-end that compiles the handful of filter strings the raw
//! endpoint actually uses into classic BPF programs, so the AF_PACKET
//! backend needs no libpcap. Filters are dual-stack: both IPv4 and IPv6
//! TCP are matched. Anything outside the grammar is an error; callers
//! wanting full pcap syntax must use the libpcap backend.
//!
//! Supported grammar:
//! - `tcp`
//! - `tcp and dst port N`
//! - `tcp and src port N`
//! - `ether dst aa:bb:cc:dd:ee:ff`

use crate::config::parse_mac;
use crate::error::PaqetError;

// Instruction classes (linux/bpf_common.h)
const BPF_LD: u16 = 0x00;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_MISC: u16 = 0x07;

// Sizes and modes
const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;
const BPF_ABS: u16 = 0x20;
const BPF_IND: u16 = 0x40;

// ALU/jump ops
const BPF_ADD: u16 = 0x00;
const BPF_MUL: u16 = 0x20;
const BPF_AND: u16 = 0x50;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_TAX: u16 = 0x00;

// Frame offsets
const ETH_OFFSET_TYPE: u32 = 12;
const ETH_HEADER_LEN: u32 = 14;
const ETHERTYPE_IPV4: u32 = 0x0800;
const ETHERTYPE_IPV6: u32 = 0x86dd;
const IP_PROTO_TCP: u32 = 6;
const IPV6_HEADER_LEN: u32 = 40;

/// One classic BPF instruction, layout-compatible with
/// `struct sock_filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Instruction {
    /// Opcode
    pub code: u16,
    /// Jump-if-true offset
    pub jt: u8,
    /// Jump-if-false offset
    pub jf: u8,
    /// Operand
    pub k: u32,
}

const fn stmt(code: u16, k: u32) -> Instruction {
    Instruction { code, jt: 0, jf: 0, k }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Instruction {
    Instruction { code, jt, jf, k }
}

/// Compile a filter string into a classic BPF program.
pub fn compile(filter: &str) -> Result<Vec<Instruction>, PaqetError> {
    let filter = filter.trim().to_ascii_lowercase();

    if let Some(port) = filter.strip_prefix("tcp and dst port ") {
        return Ok(tcp_port_filter(parse_port(port)?, PortDirection::Dst));
    }
    if let Some(port) = filter.strip_prefix("tcp and src port ") {
        return Ok(tcp_port_filter(parse_port(port)?, PortDirection::Src));
    }
    if filter == "tcp" {
        return Ok(tcp_filter());
    }
    if let Some(mac) = filter.strip_prefix("ether dst ") {
        let mac = parse_mac(mac)
            .ok_or_else(|| PaqetError::Config(format!("invalid MAC address: {}", mac)))?;
        return Ok(ether_dst_filter(mac));
    }

    Err(PaqetError::Config(format!(
        "unsupported filter: {} (use the pcap backend for complex filters)",
        filter
    )))
}

fn parse_port(s: &str) -> Result<u16, PaqetError> {
    s.trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| PaqetError::Config(format!("invalid port: {}", s)))
}

enum PortDirection {
    Src,
    Dst,
}

// "tcp and {src|dst} port N", dual-stack.
//
// IPv4 needs the IHL-scaled header length loaded into the index register
// because options may pad the header; IPv6 has a fixed 40-byte header.
fn tcp_port_filter(port: u16, dir: PortDirection) -> Vec<Instruction> {
    let port_off = match dir {
        PortDirection::Src => 0,
        PortDirection::Dst => 2,
    };
    vec![
        // 0: load EtherType
        stmt(BPF_LD | BPF_H | BPF_ABS, ETH_OFFSET_TYPE),
        // 1: IPv4? else jump to the IPv6 check at 11
        jump(BPF_JMP | BPF_JEQ | BPF_K, ETHERTYPE_IPV4, 0, 9),
        // 2-3: IPv4 protocol byte must be TCP, else reject
        stmt(BPF_LD | BPF_B | BPF_ABS, ETH_HEADER_LEN + 9),
        jump(BPF_JMP | BPF_JEQ | BPF_K, IP_PROTO_TCP, 0, 13),
        // 4-8: X = eth + IHL*4
        stmt(BPF_LD | BPF_B | BPF_ABS, ETH_HEADER_LEN),
        stmt(BPF_ALU | BPF_AND | BPF_K, 0x0f),
        stmt(BPF_ALU | BPF_MUL | BPF_K, 4),
        stmt(BPF_ALU | BPF_ADD | BPF_K, ETH_HEADER_LEN),
        stmt(BPF_MISC | BPF_TAX, 0),
        // 9-10: TCP port at X + offset, accept at 16 / reject at 17
        stmt(BPF_LD | BPF_H | BPF_IND, port_off),
        jump(BPF_JMP | BPF_JEQ | BPF_K, port as u32, 5, 6),
        // 11: IPv6? (A still holds the EtherType)
        jump(BPF_JMP | BPF_JEQ | BPF_K, ETHERTYPE_IPV6, 0, 5),
        // 12-13: IPv6 next header must be TCP
        stmt(BPF_LD | BPF_B | BPF_ABS, ETH_HEADER_LEN + 6),
        jump(BPF_JMP | BPF_JEQ | BPF_K, IP_PROTO_TCP, 0, 3),
        // 14-15: TCP port at the fixed IPv6 offset
        stmt(
            BPF_LD | BPF_H | BPF_ABS,
            ETH_HEADER_LEN + IPV6_HEADER_LEN + port_off,
        ),
        jump(BPF_JMP | BPF_JEQ | BPF_K, port as u32, 0, 1),
        // 16-17: accept / reject
        stmt(BPF_RET | BPF_K, 0xffff_ffff),
        stmt(BPF_RET | BPF_K, 0),
    ]
}

// "tcp": any TCP packet, either family.
fn tcp_filter() -> Vec<Instruction> {
    vec![
        // 0: load EtherType
        stmt(BPF_LD | BPF_H | BPF_ABS, ETH_OFFSET_TYPE),
        // 1: IPv4? else jump to the IPv6 check at 4
        jump(BPF_JMP | BPF_JEQ | BPF_K, ETHERTYPE_IPV4, 0, 2),
        // 2-3: IPv4 protocol byte
        stmt(BPF_LD | BPF_B | BPF_ABS, ETH_HEADER_LEN + 9),
        jump(BPF_JMP | BPF_JEQ | BPF_K, IP_PROTO_TCP, 3, 4),
        // 4: IPv6?
        jump(BPF_JMP | BPF_JEQ | BPF_K, ETHERTYPE_IPV6, 0, 3),
        // 5-6: IPv6 next header
        stmt(BPF_LD | BPF_B | BPF_ABS, ETH_HEADER_LEN + 6),
        jump(BPF_JMP | BPF_JEQ | BPF_K, IP_PROTO_TCP, 0, 1),
        // 7-8: accept / reject
        stmt(BPF_RET | BPF_K, 0xffff_ffff),
        stmt(BPF_RET | BPF_K, 0),
    ]
}

// "ether dst MAC": destination MAC equality, compared as a 2-byte head and
// 4-byte tail.
fn ether_dst_filter(mac: [u8; 6]) -> Vec<Instruction> {
    let head = ((mac[0] as u32) << 8) | mac[1] as u32;
    let tail = u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]);
    vec![
        // 0-1: first two bytes of the destination MAC
        stmt(BPF_LD | BPF_H | BPF_ABS, 0),
        jump(BPF_JMP | BPF_JEQ | BPF_K, head, 0, 3),
        // 2-3: last four bytes
        stmt(BPF_LD | BPF_W | BPF_ABS, 2),
        jump(BPF_JMP | BPF_JEQ | BPF_K, tail, 0, 1),
        // 4-5: accept / reject
        stmt(BPF_RET | BPF_K, 0xffff_ffff),
        stmt(BPF_RET | BPF_K, 0),
    ]
}
