//! A BLE GATT central-role session manager.
//!
//! The underlying transport only allows one outstanding GATT request per
//! connection, so after connecting and discovering a peripheral's services
//! this crate drives the subscribe/read sequence for each characteristic
//! through an explicit, strictly-serial operation queue instead of issuing
//! fire-and-forget requests.
//!
//! The platform's native BLE stack is abstracted behind the
//! [`Transport`](session::Transport) trait and all of its completion
//! callbacks are funnelled through a single event stream, so the session
//! state machine can be exercised without a real radio (see the [`fake`]
//! transport).

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod uuid;

pub mod peripheral;

pub mod characteristic;

pub mod topology;

pub mod operation;

pub mod session;

pub mod fake;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MAC(pub(crate) u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// A transport-specific unique identifier for Bluetooth devices
///
/// The underlying hardware MAC address is directly exposed on transports
/// where this is supported.
///
/// An address can be serialized/deserialized such that it's possible for
/// applications to save the address of a known device and later connect
/// back to the same device without having to re-scan
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "{}", mac)
            }
            Address::String(s) => {
                write!(f, "{}", s)
            }
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "MAC:{}", mac)
            }
            Address::String(s) => {
                write!(f, "String:{}", s)
            }
        }
    }
}

// XXX: should maybe return Result if made public somehow but we don't
// really want any allocations in the 'error' path considering that a valid
// address might not be a MAC address.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if s.contains(':') {
        let mut parts = ArrayVec::<_, 6>::new();
        for part in s.split(':') {
            if let Err(_e) = parts.try_push(part) {
                return None;
            }
        }
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 8];
        for i in 0..6 {
            bytes[i] = match u8::from_str_radix(parts[i], 16) {
                Ok(v) => v,
                Err(_e) => {
                    return None;
                }
            };
        }
        Some(u64::from_le_bytes(bytes))
    } else {
        None
    }
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(Address::MAC(MAC(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

#[test]
fn mac_two_way() {
    let addr = Address::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert!(matches!(addr, Address::MAC(_)));
    let str = addr.to_string();
    // Note: we are also intentionally checking that we format the address
    // octets as uppercase considering that some platforms are very particular
    // about this when asked to connect to an address string.
    assert_eq!(str, "F1:E2:D3:C4:B5:A6");

    let addr = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(addr, Address::String(_)));
    let str = addr.to_string();
    assert_eq!(str, "18c2a267-a539-4423-aecc-edeeb2784bcc");
}

// On transports where it's supported a CharacteristicHandle should correspond
// to the underlying ATT attribute handle, or else a similar, sortable value
// that represents the ordering of characteristics as they are on the device.
//
// Notably we don't use a Uuid as the unique key for a characteristic since
// it's possible for devices to expose the same characteristic (with the same
// uuid) multiple times, differentiated by attribute handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorHandle(pub u32);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Insufficient Authorization")]
    InsufficientAuthorization,

    #[error("Insufficient Encryption")]
    InsufficientEncryption,

    #[error("Read Not Permitted")]
    ReadNotPermitted,

    #[error("Write Not Permitted")]
    WriteNotPermitted,

    #[error("Unsupported request")]
    Unsupported,

    #[error("Congested")]
    Congested,

    #[error("General Failure")]
    GeneralFailure(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("The system is unable to communicate with this peripheral currently")]
    PeripheralUnreachable,

    #[error("There was a GATT communication protocol error")]
    PeripheralGattProtocolError(#[from] GattError),

    #[error("Invalid State Reference")]
    InvalidStateReference,

    #[error("The system doesn't support this request / operation")]
    Unsupported,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
