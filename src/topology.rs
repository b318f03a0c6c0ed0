use log::trace;
use uuid::Uuid;

use crate::characteristic::{Characteristic, CharacteristicProperties};
use crate::operation::Operation;
use crate::uuid::CCCD_UUID;
use crate::{CharacteristicHandle, DescriptorHandle};

// The raw discovery result, as reported by a transport. The order of
// services, and of characteristics within each service, is the order the
// transport reported them and is preserved all the way through to the
// operation plan so that post-discovery behaviour is reproducible.

#[derive(Clone, Debug)]
pub struct DescriptorInfo {
    pub handle: DescriptorHandle,
    pub uuid: Uuid,
}

#[derive(Clone, Debug)]
pub struct CharacteristicInfo {
    pub handle: CharacteristicHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<DescriptorInfo>,
}

#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// One discovered service and its characteristic records, in discovery order
#[derive(Clone, Debug)]
pub struct ServiceTopology {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

/// The service/characteristic layout of a connected peripheral
///
/// Built once from a successful discovery result and read-only thereafter.
/// A new connection attempt (and so a new discovery) gets a new `Topology`.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    services: Vec<ServiceTopology>,
}

impl Topology {
    /// Builds a `Topology` from a raw discovery result, resolving the CCCD
    /// location for every notify-flagged characteristic.
    pub fn from_discovery(services: Vec<ServiceInfo>) -> Self {
        let services = services
            .into_iter()
            .map(|service| {
                let characteristics = service
                    .characteristics
                    .into_iter()
                    .map(|info| {
                        let cccd = if info.properties.contains(CharacteristicProperties::NOTIFY) {
                            let cccd = info.descriptors
                                           .iter()
                                           .find(|descriptor| descriptor.uuid == CCCD_UUID)
                                           .map(|descriptor| descriptor.handle);
                            if cccd.is_none() {
                                trace!("Characteristic {} advertises NOTIFY but has no CCCD; \
                                        treating as notify-incapable",
                                       info.uuid);
                            }
                            cccd
                        } else {
                            None
                        };
                        Characteristic { handle: info.handle,
                                         uuid: info.uuid,
                                         properties: info.properties,
                                         cccd }
                    })
                    .collect();
                ServiceTopology { uuid: service.uuid,
                                  characteristics }
            })
            .collect();

        Topology { services }
    }

    pub fn services(&self) -> &[ServiceTopology] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.iter().all(|service| service.characteristics.is_empty())
    }

    /// Looks up a characteristic record by its attribute handle.
    pub fn characteristic(&self, handle: CharacteristicHandle) -> Option<&Characteristic> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| characteristic.handle == handle)
    }

    /// Flattens the topology into the ordered operation plan: for each
    /// characteristic in discovery order, a `SubscribeNotification` entry if
    /// it is notify-capable, immediately followed by a `ReadCharacteristic`
    /// entry (every characteristic is read, notify-capable or not).
    pub fn operation_plan(&self) -> Vec<Operation> {
        let mut plan = vec![];
        for service in &self.services {
            for characteristic in &service.characteristics {
                if characteristic.supports_notify() {
                    plan.push(Operation::SubscribeNotification(characteristic.handle));
                }
                plan.push(Operation::ReadCharacteristic(characteristic.handle));
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::uuid_from_u16;

    fn characteristic_info(handle: u32, uuid: u16, properties: CharacteristicProperties,
                           descriptors: Vec<DescriptorInfo>)
                           -> CharacteristicInfo {
        CharacteristicInfo { handle: CharacteristicHandle(handle),
                             uuid: uuid_from_u16(uuid),
                             properties,
                             descriptors }
    }

    fn cccd(handle: u32) -> DescriptorInfo {
        DescriptorInfo { handle: DescriptorHandle(handle),
                         uuid: CCCD_UUID }
    }

    #[test]
    fn plan_interleaves_subscribe_before_read_in_discovery_order() {
        // One service, characteristic A (notify+read) then B (read-only):
        // the expected plan is [Subscribe(A), Read(A), Read(B)]
        let a = characteristic_info(1,
                                    0x2a19,
                                    CharacteristicProperties::READ
                                    | CharacteristicProperties::NOTIFY,
                                    vec![cccd(2)]);
        let b = characteristic_info(3, 0x2a29, CharacteristicProperties::READ, vec![]);
        let topology = Topology::from_discovery(vec![ServiceInfo {
            uuid: uuid_from_u16(0x180f),
            characteristics: vec![a, b],
        }]);

        assert_eq!(topology.operation_plan(),
                   vec![Operation::SubscribeNotification(CharacteristicHandle(1)),
                        Operation::ReadCharacteristic(CharacteristicHandle(1)),
                        Operation::ReadCharacteristic(CharacteristicHandle(3))]);
    }

    #[test]
    fn plan_preserves_service_then_characteristic_discovery_order() {
        let first = ServiceInfo {
            uuid: uuid_from_u16(0x180a),
            characteristics: vec![
                characteristic_info(10, 0x2a24, CharacteristicProperties::READ, vec![]),
                characteristic_info(12, 0x2a25, CharacteristicProperties::READ, vec![]),
            ],
        };
        let second = ServiceInfo {
            uuid: uuid_from_u16(0x180f),
            characteristics: vec![
                characteristic_info(20,
                                    0x2a19,
                                    CharacteristicProperties::READ
                                    | CharacteristicProperties::NOTIFY,
                                    vec![cccd(21)]),
            ],
        };

        let topology = Topology::from_discovery(vec![first, second]);
        assert_eq!(topology.operation_plan(),
                   vec![Operation::ReadCharacteristic(CharacteristicHandle(10)),
                        Operation::ReadCharacteristic(CharacteristicHandle(12)),
                        Operation::SubscribeNotification(CharacteristicHandle(20)),
                        Operation::ReadCharacteristic(CharacteristicHandle(20))]);
    }

    #[test]
    fn notify_without_cccd_is_planned_read_only() {
        let orphan = characteristic_info(1,
                                         0x2a19,
                                         CharacteristicProperties::READ
                                         | CharacteristicProperties::NOTIFY,
                                         vec![DescriptorInfo {
                                             handle: DescriptorHandle(2),
                                             // Some unrelated descriptor, not a CCCD
                                             uuid: uuid_from_u16(0x2901),
                                         }]);
        let topology = Topology::from_discovery(vec![ServiceInfo {
            uuid: uuid_from_u16(0x180f),
            characteristics: vec![orphan],
        }]);

        let characteristic = topology.characteristic(CharacteristicHandle(1)).unwrap();
        assert!(!characteristic.supports_notify());
        assert_eq!(topology.operation_plan(),
                   vec![Operation::ReadCharacteristic(CharacteristicHandle(1))]);
    }

    #[test]
    fn characteristic_lookup_by_handle() {
        let topology = Topology::from_discovery(vec![ServiceInfo {
            uuid: uuid_from_u16(0x180f),
            characteristics: vec![characteristic_info(7,
                                                      0x2a19,
                                                      CharacteristicProperties::READ,
                                                      vec![])],
        }]);

        assert_eq!(topology.characteristic(CharacteristicHandle(7)).unwrap().uuid,
                   uuid_from_u16(0x2a19));
        assert!(topology.characteristic(CharacteristicHandle(8)).is_none());
        assert!(!topology.is_empty());
        assert!(Topology::default().is_empty());
    }
}
