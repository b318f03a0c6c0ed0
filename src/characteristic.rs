use bitflags::bitflags;
use uuid::Uuid;

use crate::{CharacteristicHandle, DescriptorHandle};

bitflags! {
    /// The property bit-set advertised for a characteristic during
    /// discovery, using the assigned values from the GATT specification.
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITES = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

// NB: a characteristic is keyed by its attribute handle, not its uuid, since
// devices may expose the same uuid multiple times (see lib.rs).
//
// `cccd` is resolved once, while building the topology from a discovery
// result. A characteristic that advertises NOTIFY but has no resolvable CCCD
// can't actually have notifications enabled, so for operational purposes it
// is treated as notify-incapable rather than failing discovery.

/// A single characteristic record within a discovered [`Topology`]
///
/// [`Topology`]: crate::topology::Topology
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Characteristic {
    pub handle: CharacteristicHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub cccd: Option<DescriptorHandle>,
}

impl Characteristic {
    /// Whether notifications can actually be enabled: the NOTIFY property
    /// is advertised *and* a CCCD was resolved to write to.
    pub fn supports_notify(&self) -> bool {
        self.properties.contains(CharacteristicProperties::NOTIFY) && self.cccd.is_some()
    }

    pub fn supports_read(&self) -> bool {
        self.properties.contains(CharacteristicProperties::READ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::uuid_from_u16;

    #[test]
    fn notify_requires_a_resolved_cccd() {
        let mut characteristic = Characteristic {
            handle: CharacteristicHandle(1),
            uuid: uuid_from_u16(0x2a19),
            properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            cccd: None,
        };
        assert!(characteristic.supports_read());
        assert!(!characteristic.supports_notify());

        characteristic.cccd = Some(DescriptorHandle(2));
        assert!(characteristic.supports_notify());
    }
}
