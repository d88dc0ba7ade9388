use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::Error;

use super::instance::{Config, InstanceRef};
use super::EPHEMERAL_PORT_FIRST;

// Number of ports in the ephemeral range
const EPHEMERAL_SPAN: u16 = u16::MAX - EPHEMERAL_PORT_FIRST + 1;

/// Owns the (station address, station port) space of one service.
///
/// Ephemeral assignment rotates a cursor through the ephemeral range; the
/// cursor is seeded randomly at construction and advances by one after every
/// assignment, wrapping back to the bottom of the range past the top.
pub(crate) struct PortAllocator {
    cursor: u16,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            cursor: EPHEMERAL_PORT_FIRST + rand::random::<u16>() % EPHEMERAL_SPAN,
        }
    }

    /// Validates and, for ephemeral requests, assigns `config`'s station
    /// port against every other endpoint in `instances`.
    pub fn bind(
        &mut self,
        instances: &[InstanceRef],
        binder: &InstanceRef,
        config: &mut Config,
    ) -> Result<(), Error> {
        if config.accept_any_port {
            // Listens on every port; nothing to reserve
            return Ok(());
        }

        if config.station_port != 0 {
            if !config.allow_duplicate_port
                && port_in_use(instances, binder, config.station_address, config.station_port)
            {
                return Err(Error::AccessDenied);
            }

            return Ok(());
        }

        if config.allow_duplicate_port {
            // Duplicates are welcome, so the cursor value is taken as-is;
            // concurrent binders disambiguate through their remote filters
            config.station_port = self.cursor;
            self.advance();

            return Ok(());
        }

        for _ in 0..EPHEMERAL_SPAN {
            let candidate = self.cursor;
            self.advance();

            if !port_in_use(instances, binder, config.station_address, candidate) {
                config.station_port = candidate;
                return Ok(());
            }
        }

        Err(Error::OutOfResources)
    }

    fn advance(&mut self) {
        self.cursor = if self.cursor == u16::MAX {
            EPHEMERAL_PORT_FIRST
        } else {
            self.cursor + 1
        };
    }
}

fn port_in_use(
    instances: &[InstanceRef],
    binder: &InstanceRef,
    address: Ipv4Addr,
    port: u16,
) -> bool {
    instances.iter().any(|instance_ref| {
        if Arc::ptr_eq(instance_ref, binder) {
            return false;
        }

        let inst = instance_ref.read().unwrap();

        match &inst.config {
            Some(config) => {
                !config.accept_any_port
                    && config.station_address == address
                    && config.station_port == port
            }
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;

    use super::super::instance::Instance;
    use super::*;

    fn instance_with(config: Option<Config>) -> InstanceRef {
        let mut instance = Instance::new(0);
        instance.config = config;
        Arc::new(RwLock::new(instance))
    }

    fn bound(address: Ipv4Addr, port: u16) -> InstanceRef {
        instance_with(Some(Config {
            station_address: address,
            station_port: port,
            ..Default::default()
        }))
    }

    fn wildcard() -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    #[test]
    fn explicit_port_collision() {
        let existing = bound(wildcard(), 5000);
        let binder = instance_with(None);
        let instances = vec![Arc::clone(&existing), Arc::clone(&binder)];

        let mut allocator = PortAllocator::new();

        let mut config = Config {
            station_port: 5000,
            ..Default::default()
        };

        assert_eq!(
            allocator.bind(&instances, &binder, &mut config),
            Err(Error::AccessDenied)
        );

        config.allow_duplicate_port = true;
        assert_eq!(allocator.bind(&instances, &binder, &mut config), Ok(()));
    }

    #[test]
    fn explicit_port_distinct_addresses() {
        let existing = bound(Ipv4Addr::new(10, 0, 0, 5), 5000);
        let binder = instance_with(None);
        let instances = vec![Arc::clone(&existing), Arc::clone(&binder)];

        let mut allocator = PortAllocator::new();

        // The reservation key is the full (address, port) pair
        let mut config = Config {
            station_address: Ipv4Addr::new(10, 0, 0, 6),
            station_port: 5000,
            ..Default::default()
        };

        assert_eq!(allocator.bind(&instances, &binder, &mut config), Ok(()));
    }

    #[test]
    fn any_port_skips_reservation() {
        let existing = bound(wildcard(), 5000);
        let binder = instance_with(None);
        let instances = vec![Arc::clone(&existing), Arc::clone(&binder)];

        let mut allocator = PortAllocator::new();

        let mut config = Config {
            accept_any_port: true,
            station_port: 5000,
            ..Default::default()
        };

        assert_eq!(allocator.bind(&instances, &binder, &mut config), Ok(()));
    }

    #[test]
    fn ephemeral_rotation() {
        let binder = instance_with(None);
        let instances = vec![Arc::clone(&binder)];

        let mut allocator = PortAllocator { cursor: 40_000 };

        let mut first = Config::default();
        allocator.bind(&instances, &binder, &mut first).unwrap();
        assert_eq!(first.station_port, 40_000);

        let mut second = Config::default();
        allocator.bind(&instances, &binder, &mut second).unwrap();
        assert_eq!(second.station_port, 40_001);
    }

    #[test]
    fn ephemeral_skips_taken_ports() {
        let binder = instance_with(None);
        let instances = vec![
            bound(wildcard(), 40_000),
            bound(wildcard(), 40_001),
            Arc::clone(&binder),
        ];

        let mut allocator = PortAllocator { cursor: 40_000 };

        let mut config = Config::default();
        allocator.bind(&instances, &binder, &mut config).unwrap();
        assert_eq!(config.station_port, 40_002);
    }

    #[test]
    fn ephemeral_wraps_into_ephemeral_range() {
        let binder = instance_with(None);
        let instances = vec![Arc::clone(&binder)];

        let mut allocator = PortAllocator { cursor: u16::MAX };

        let mut first = Config::default();
        allocator.bind(&instances, &binder, &mut first).unwrap();
        assert_eq!(first.station_port, u16::MAX);

        // The cursor wraps past the top of the range to the first ephemeral
        // port, never into the well-known range
        let mut second = Config::default();
        allocator.bind(&instances, &binder, &mut second).unwrap();
        assert_eq!(second.station_port, EPHEMERAL_PORT_FIRST);
    }

    #[test]
    fn ephemeral_duplicates_skip_collision_scan() {
        let binder = instance_with(None);
        let instances = vec![bound(wildcard(), 40_000), Arc::clone(&binder)];

        let mut allocator = PortAllocator { cursor: 40_000 };

        // With duplicates allowed the cursor value is assigned even though
        // another endpoint owns it
        let mut config = Config {
            allow_duplicate_port: true,
            ..Default::default()
        };

        allocator.bind(&instances, &binder, &mut config).unwrap();
        assert_eq!(config.station_port, 40_000);
    }

    #[test]
    fn seeded_cursor_in_range() {
        for _ in 0..64 {
            let allocator = PortAllocator::new();
            assert!(allocator.cursor >= EPHEMERAL_PORT_FIRST);
        }
    }
}
