use crate::prelude::*;
use crate::error::CatalogError;
use crate::solarman::modbus::ReadFunction;

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

/// Word order of two-register values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    #[default]
    HighFirst,
    LowFirst,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueKind {
    Unsigned,
    Signed,
    /// `(raw + offset) / divisor`, kept exact.
    Scaled {
        divisor: u32,
        #[serde(default)]
        signed: bool,
        #[serde(default)]
        offset: i64,
    },
    Enum {
        labels: BTreeMap<u32, String>,
    },
    Bitfield,
}

impl ValueKind {
    pub fn scaled(divisor: u32) -> Self {
        Self::Scaled {
            divisor,
            signed: false,
            offset: 0,
        }
    }

    pub fn scaled_signed(divisor: u32) -> Self {
        Self::Scaled {
            divisor,
            signed: true,
            offset: 0,
        }
    }

    pub fn labels(pairs: &[(u32, &str)]) -> Self {
        Self::Enum {
            labels: pairs.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        }
    }
}

// RegisterSpec {{{
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct RegisterSpec {
    pub name: String,
    pub address: u16,
    #[serde(default = "RegisterSpec::default_width")]
    pub width: u16,
    pub kind: ValueKind,
    #[serde(default)]
    pub word_order: WordOrder,
}

impl RegisterSpec {
    pub fn new(name: &str, address: u16, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            address,
            width: 1,
            kind,
            word_order: WordOrder::default(),
        }
    }

    /// Make this a two-register (32-bit) value.
    pub fn double(mut self, word_order: WordOrder) -> Self {
        self.width = 2;
        self.word_order = word_order;
        self
    }

    /// One past the last address this register occupies.
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.width)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if !(1..=2).contains(&self.width) {
            return Err(CatalogError::BadWidth {
                name: self.name.clone(),
                width: self.width,
            });
        }
        if self.end() > 0x1_0000 {
            return Err(CatalogError::AddressOverflow {
                name: self.name.clone(),
                address: self.address,
            });
        }
        if let ValueKind::Scaled { divisor: 0, .. } = self.kind {
            return Err(CatalogError::ZeroDivisor {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn default_width() -> u16 {
        1
    }
} // }}}

// RegisterSet {{{
/// Registers read together with one function code.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct RegisterSet {
    pub name: String,
    pub function: ReadFunction,
    pub registers: Vec<RegisterSpec>,
}

impl RegisterSet {
    pub fn new(name: &str, function: ReadFunction, registers: Vec<RegisterSpec>) -> Self {
        Self {
            name: name.to_string(),
            function,
            registers,
        }
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for register in &self.registers {
            register.validate()?;
            if !seen.insert(register.name.as_str()) {
                return Err(CatalogError::DuplicateName {
                    set: self.name.clone(),
                    name: register.name.clone(),
                });
            }
        }
        Ok(())
    }
} // }}}

// Catalog {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Catalog {
    pub sets: Vec<RegisterSet>,
}

impl Catalog {
    pub const POLLING: &'static str = "polling";
    pub const DEVICE_INFO: &'static str = "device_info";
    pub const CONFIGURATION: &'static str = "configuration";

    /// Load a catalog from a YAML (or JSON) file.
    pub fn from_file(file: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file)
            .map_err(|err| anyhow!("Error reading register catalog {}: {}", file, err))?;
        Self::from_yaml(&content)
            .map_err(|err| anyhow!("Error parsing register catalog {}: {}", file, err))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let catalog: Self = serde_yaml::from_str(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        if self.set(Self::POLLING).is_none() {
            bail!("register catalog has no '{}' set", Self::POLLING);
        }
        for set in &self.sets {
            set.validate()?;
        }
        Ok(())
    }

    pub fn set(&self, name: &str) -> Option<&RegisterSet> {
        self.sets.iter().find(|s| s.name == name)
    }
} // }}}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_yaml_catalog() -> Result<()> {
        let catalog = Catalog::from_yaml(
            r#"
sets:
  - name: polling
    function: read_holding
    registers:
      - name: Battery SOC
        address: 184
        kind: { type: unsigned }
      - name: Battery Current
        address: 190
        kind: { type: scaled, divisor: 100, signed: true }
      - name: Total PV Energy
        address: 96
        width: 2
        word_order: low_first
        kind: { type: scaled, divisor: 10 }
      - name: Running State
        address: 59
        kind:
          type: enum
          labels: { 0: Standby, 2: Normal }
"#,
        )?;

        let polling = catalog.set(Catalog::POLLING).unwrap();
        assert_eq!(polling.function, ReadFunction::ReadHolding);
        assert_eq!(polling.registers.len(), 4);
        assert_eq!(polling.registers[1].kind, ValueKind::scaled_signed(100));
        assert_eq!(polling.registers[2].width, 2);
        assert_eq!(polling.registers[2].word_order, WordOrder::LowFirst);
        assert_eq!(polling.registers[3].kind, ValueKind::labels(&[(0, "Standby"), (2, "Normal")]));
        Ok(())
    }

    #[test]
    fn rejects_duplicate_names() {
        let set = RegisterSet::new(
            "polling",
            ReadFunction::ReadHolding,
            vec![
                RegisterSpec::new("a", 1, ValueKind::Unsigned),
                RegisterSpec::new("a", 2, ValueKind::Unsigned),
            ],
        );
        assert!(matches!(set.validate(), Err(CatalogError::DuplicateName { .. })));
    }

    #[test]
    fn rejects_bad_width_and_overflow() {
        let mut wide = RegisterSpec::new("w", 1, ValueKind::Unsigned);
        wide.width = 3;
        assert!(matches!(wide.validate(), Err(CatalogError::BadWidth { .. })));

        let last = RegisterSpec::new("l", 0xFFFF, ValueKind::Unsigned).double(WordOrder::HighFirst);
        assert!(matches!(last.validate(), Err(CatalogError::AddressOverflow { .. })));
    }

    #[test]
    fn catalog_needs_polling_set() {
        assert!(Catalog::from_yaml("sets: []").is_err());
    }
}
