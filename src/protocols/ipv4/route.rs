use super::{Iface, Ipv4Address};
use crate::network::Device;
use std::sync::Arc;

/// One forwarding entry: datagrams whose destination falls in
/// `network`/`netmask` leave through `iface`, optionally via a gateway.
#[derive(Clone)]
pub(crate) struct Route {
    pub network: Ipv4Address,
    pub netmask: Ipv4Address,
    /// The next relay, or `None` when the destination is directly reachable.
    pub nexthop: Option<Ipv4Address>,
    pub iface: Arc<Iface>,
}

/// The routing table. Lookups prefer the most specific matching prefix.
#[derive(Default)]
pub(crate) struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn add(
        &mut self,
        network: Ipv4Address,
        netmask: Ipv4Address,
        nexthop: Option<Ipv4Address>,
        iface: Arc<Iface>,
    ) {
        tracing::debug!(
            %network,
            %netmask,
            nexthop = %nexthop.unwrap_or(Ipv4Address::ANY),
            dev = iface.device.name(),
            "route added"
        );
        self.routes.push(Route {
            network,
            netmask,
            nexthop,
            iface,
        });
    }

    /// Longest-prefix match for `dst`.
    pub fn lookup(&self, dst: Ipv4Address) -> Option<&Route> {
        let mut candidate: Option<&Route> = None;
        for route in &self.routes {
            if dst.masked(route.netmask) == route.network
                && candidate.map_or(true, |c| route.netmask.to_u32() > c.netmask.to_u32())
            {
                candidate = Some(route);
            }
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dummy::Dummy;

    fn iface(unicast: &str) -> Arc<Iface> {
        Arc::new(Iface::new(
            Arc::new(Dummy::new("dummy0", 1500)),
            unicast.parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
        ))
    }

    #[test]
    fn prefers_the_most_specific_prefix() {
        let near = iface("192.0.2.1");
        let far = iface("198.51.100.1");
        let mut table = RouteTable::default();
        table.add(
            Ipv4Address::ANY,
            Ipv4Address::ANY,
            Some("198.51.100.254".parse().unwrap()),
            far.clone(),
        );
        table.add(
            "192.0.2.0".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
            None,
            near.clone(),
        );

        let route = table.lookup("192.0.2.7".parse().unwrap()).unwrap();
        assert!(route.nexthop.is_none());
        assert_eq!(route.iface.unicast, near.unicast);

        let route = table.lookup("203.0.113.9".parse().unwrap()).unwrap();
        assert_eq!(route.nexthop, Some("198.51.100.254".parse().unwrap()));
    }

    #[test]
    fn no_route_without_a_default() {
        let mut table = RouteTable::default();
        table.add(
            "192.0.2.0".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
            None,
            iface("192.0.2.1"),
        );
        assert!(table.lookup("203.0.113.9".parse().unwrap()).is_none());
    }
}
