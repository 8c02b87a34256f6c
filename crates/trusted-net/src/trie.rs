use std::net::IpAddr;

use ipnet::IpNet;

/// A binary prefix trie answering "is this address inside any stored range".
///
/// IPv4 and IPv6 ranges live under separate roots. IPv4-mapped IPv6
/// addresses (`::ffff:a.b.c.d`) are looked up in the IPv4 root.
#[derive(Default)]
pub struct RangeTrie {
    v4: Node,
    v6: Node,
    ranges: usize,
}

#[derive(Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    covers: bool,
}

/// Address as a left-aligned 128-bit integer plus its bit width.
fn address_bits(addr: IpAddr) -> (u128, u8) {
    match addr {
        IpAddr::V4(v4) => ((u32::from(v4) as u128) << 96, 32),
        IpAddr::V6(v6) => (u128::from(v6), 128),
    }
}

fn bit_at(bits: u128, index: u8) -> usize {
    ((bits >> (127 - index as u32)) & 1) as usize
}

fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

impl RangeTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a network. Inserting a range nested inside an existing one is
    /// harmless; the outer range already covers it.
    pub fn insert(&mut self, network: IpNet) {
        let network = network.trunc();
        let (bits, _) = address_bits(network.network());
        let mut node = match network {
            IpNet::V4(_) => &mut self.v4,
            IpNet::V6(_) => &mut self.v6,
        };

        for index in 0..network.prefix_len() {
            node = &mut **node.children[bit_at(bits, index)].get_or_insert_with(Box::default);
        }

        if !node.covers {
            node.covers = true;
            self.ranges += 1;
        }
    }

    /// Returns `true` when some stored range contains `addr`.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = canonical(addr);
        let (bits, width) = address_bits(addr);
        let mut node = match addr {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };

        if node.covers {
            return true;
        }
        for index in 0..width {
            match &node.children[bit_at(bits, index)] {
                Some(child) if child.covers => return true,
                Some(child) => node = child,
                None => return false,
            }
        }
        false
    }

    /// Number of distinct ranges inserted.
    pub fn len(&self) -> usize {
        self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges == 0
    }
}
