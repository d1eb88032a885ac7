//! Built-in test catalog
//!
//! Both binaries build their registry from [`register_all`]: `kola` to
//! select and dispatch tests, `kolet` to find native functions by test
//! name inside the guest.

pub mod basic;
pub mod network;
pub mod upgrade;

use crate::registry::RegistryBuilder;

/// Register every built-in test
pub fn register_all(builder: &mut RegistryBuilder) {
    basic::register(builder);
    network::register(builder);
    upgrade::register(builder);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Table;

    #[test]
    fn test_catalog_builds() {
        let mut builder = RegistryBuilder::new();
        register_all(&mut builder);
        let registry = builder.build().unwrap();
        assert!(registry.get("coreos.basic").is_some());
        assert!(registry
            .table(Table::UpgradeTests)
            .contains_key(upgrade::UPGRADE_BASIC));
        assert!(!registry
            .table(Table::Tests)
            .contains_key(upgrade::UPGRADE_BASIC));
        assert!(registry.get(upgrade::UPGRADE_BASIC).is_some());
    }
}
