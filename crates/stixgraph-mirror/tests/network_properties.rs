//! Containment properties of address ranges.

use proptest::prelude::*;
use std::net::Ipv4Addr;
use stixgraph_mirror::NetworkRange;

proptest! {
    #[test]
    fn every_network_contains_its_addresses(addr in any::<u32>(), prefix in 0u8..=32) {
        let host = Ipv4Addr::from(addr).to_string();
        let network = NetworkRange::parse(&format!("{host}/{prefix}")).unwrap();
        let single = NetworkRange::parse(&host).unwrap();
        prop_assert!(network.contains(&single));
    }

    #[test]
    fn hex_bounds_sort_like_addresses(a in any::<u32>(), b in any::<u32>()) {
        let ra = NetworkRange::parse(&Ipv4Addr::from(a).to_string()).unwrap();
        let rb = NetworkRange::parse(&Ipv4Addr::from(b).to_string()).unwrap();
        prop_assert_eq!(a.cmp(&b), ra.lo_hex().cmp(&rb.lo_hex()));
    }

    #[test]
    fn longer_prefixes_nest(addr in any::<u32>(), short in 0u8..=16, extra in 0u8..=16) {
        let host = Ipv4Addr::from(addr).to_string();
        let outer = NetworkRange::parse(&format!("{host}/{short}")).unwrap();
        let inner = NetworkRange::parse(&format!("{host}/{}", short + extra)).unwrap();
        prop_assert!(outer.contains(&inner));
    }
}
