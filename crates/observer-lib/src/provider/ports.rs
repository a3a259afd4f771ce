//! TCP port accounting from procfs socket tables

use std::collections::HashSet;

/// Kernel TCP state code for a listening socket
pub const TCP_LISTEN: u8 = 0x0A;

/// Fallback ephemeral range when the sysctl can't be read
pub const DEFAULT_EPHEMERAL_RANGE: (u16, u16) = (32768, 60999);

/// One row of `/proc/<pid>/net/tcp` or `tcp6`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEntry {
    pub local_port: u16,
    pub state: u8,
    pub inode: u64,
}

/// Parse a socket table. The header row and malformed rows are skipped.
pub fn parse_socket_table(content: &str) -> Vec<SocketEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(parse_socket_line)
        .collect()
}

fn parse_socket_line(line: &str) -> Option<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    let (_, port_hex) = fields[1].rsplit_once(':')?;
    let local_port = u16::from_str_radix(port_hex, 16).ok()?;
    let state = u8::from_str_radix(fields[3], 16).ok()?;
    let inode = fields[9].parse().ok()?;
    Some(SocketEntry {
        local_port,
        state,
        inode,
    })
}

/// Extract the inode from an fd link target such as `socket:[12345]`
pub fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Parse `ip_local_port_range` ("32768\t60999")
pub fn parse_port_range(content: &str) -> Option<(u16, u16)> {
    let mut parts = content.split_whitespace();
    let low = parts.next()?.parse().ok()?;
    let high = parts.next()?.parse().ok()?;
    (low <= high).then_some((low, high))
}

/// Sockets owned by the process (by inode)
pub fn count_owned<'a>(
    entries: impl IntoIterator<Item = &'a SocketEntry>,
    inodes: &HashSet<u64>,
) -> usize {
    entries
        .into_iter()
        .filter(|e| e.inode != 0 && inodes.contains(&e.inode))
        .count()
}

/// Owned, non-listening sockets whose local port is in the ephemeral range
pub fn count_ephemeral<'a>(
    entries: impl IntoIterator<Item = &'a SocketEntry>,
    inodes: &HashSet<u64>,
    range: (u16, u16),
) -> usize {
    entries
        .into_iter()
        .filter(|e| e.inode != 0 && inodes.contains(&e.inode))
        .filter(|e| e.state != TCP_LISTEN)
        .filter(|e| e.local_port >= range.0 && e.local_port <= range.1)
        .count()
}
