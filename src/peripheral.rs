use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Address;

// A Peripheral is a plain, caller-owned value identifying the physical
// device, handed to a Session when connecting. Unlike a Session it carries
// no connection state, so it can be cloned freely, saved by an application
// and re-used across any number of connection attempts.

/// Identifies a physical BLE device by address, with an optional
/// human-readable name picked up while scanning.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peripheral {
    address: Address,
    name: Option<String>,
}

impl Peripheral {
    pub fn new(address: Address, name: Option<String>) -> Self {
        Self { address, name }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("address", &self.address.to_string())
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

impl FromStr for Peripheral {
    type Err = std::convert::Infallible;

    /// Parses a bare address string into an unnamed `Peripheral`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Peripheral::new(Address::from_str(s)?, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefers_name() {
        let anon = Peripheral::from_str("F1:E2:D3:C4:B5:A6").unwrap();
        assert_eq!(anon.to_string(), "F1:E2:D3:C4:B5:A6");

        let named = Peripheral::new(anon.address().clone(), Some("Nano 33".to_string()));
        assert_eq!(named.to_string(), "Nano 33 (F1:E2:D3:C4:B5:A6)");
    }
}
