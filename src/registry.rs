//! Test Registry
//!
//! Registrations accumulate in a [`RegistryBuilder`]; [`RegistryBuilder::build`]
//! validates them and returns an immutable [`Registry`]. Standard tests and
//! upgrade tests live in separate tables with identical rules.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use semver::Version;

use crate::register::Test;
use crate::{Error, Result};

/// Which table a registration goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Tests,
    UpgradeTests,
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Table::Tests => write!(f, "tests"),
            Table::UpgradeTests => write!(f, "upgrade tests"),
        }
    }
}

/// Accumulates registrations before validation
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    tests: Vec<Test>,
    upgrade_tests: Vec<Test>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a standard test
    pub fn register(&mut self, test: Test) -> &mut Self {
        self.tests.push(test);
        self
    }

    /// Register an upgrade test
    pub fn register_upgrade(&mut self, test: Test) -> &mut Self {
        self.upgrade_tests.push(test);
        self
    }

    /// Validate every registration. Errors name the offending test.
    ///
    /// A name may only live in one table, since `kolet` resolves native
    /// functions by test name alone.
    pub fn build(self) -> Result<Registry> {
        let tests = build_table(Table::Tests, self.tests)?;
        let upgrade_tests = build_table(Table::UpgradeTests, self.upgrade_tests)?;
        if let Some(name) = tests.keys().find(|n| upgrade_tests.contains_key(*n)) {
            return Err(Error::Registration(format!(
                "test {} already registered in {}",
                name,
                Table::Tests
            )));
        }
        Ok(Registry {
            tests,
            upgrade_tests,
        })
    }
}

fn build_table(table: Table, tests: Vec<Test>) -> Result<BTreeMap<String, Arc<Test>>> {
    let mut out = BTreeMap::new();
    for test in tests {
        validate(&test)?;
        match out.entry(test.name.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::Registration(format!(
                    "test {} already registered in {}",
                    test.name, table
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(test));
            }
        }
    }
    Ok(out)
}

fn validate(test: &Test) -> Result<()> {
    if test.name.is_empty() {
        return Err(Error::Registration("test registered without a name".into()));
    }
    if let Some(end) = &test.end_version {
        let min = test.min_version.clone().unwrap_or(Version::new(0, 0, 0));
        if *end <= min {
            return Err(Error::Registration(format!(
                "test {} has an end version {} that is not after its min version {}",
                test.name, end, min
            )));
        }
    }
    let mut seen = HashSet::new();
    for func in &test.native_funcs {
        if !seen.insert(func.name) {
            return Err(Error::Registration(format!(
                "test {} declares native function {} twice",
                test.name, func.name
            )));
        }
    }
    Ok(())
}

/// Validated, read-only test tables
#[derive(Debug, Default, Clone)]
pub struct Registry {
    tests: BTreeMap<String, Arc<Test>>,
    upgrade_tests: BTreeMap<String, Arc<Test>>,
}

impl Registry {
    pub fn table(&self, table: Table) -> &BTreeMap<String, Arc<Test>> {
        match table {
            Table::Tests => &self.tests,
            Table::UpgradeTests => &self.upgrade_tests,
        }
    }

    /// Standard tests in name order
    pub fn tests(&self) -> impl Iterator<Item = &Arc<Test>> {
        self.tests.values()
    }

    /// Upgrade tests in name order
    pub fn upgrade_tests(&self) -> impl Iterator<Item = &Arc<Test>> {
        self.upgrade_tests.values()
    }

    /// Look a test up in either table
    pub fn get(&self, name: &str) -> Option<&Arc<Test>> {
        self.tests.get(name).or_else(|| self.upgrade_tests.get(name))
    }

    pub fn len(&self) -> usize {
        self.tests.len() + self.upgrade_tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{NativeFunc, NativeFuture};

    fn test(name: &str) -> Test {
        Test::new(name, |_c| async { Ok(()) })
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut b = RegistryBuilder::new();
        b.register(test("coreos.basic")).register(test("coreos.basic"));
        let err = b.build().unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_name_in_both_tables_rejected() {
        let mut b = RegistryBuilder::new();
        b.register(test("coreos.basic"))
            .register_upgrade(test("coreos.basic"));
        let err = b.build().unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
        assert!(err.to_string().contains("coreos.basic"));
    }

    #[test]
    fn test_get_searches_both_tables() {
        let mut b = RegistryBuilder::new();
        b.register(test("coreos.basic"))
            .register_upgrade(test("fcos.upgrade.basic"));
        let reg = b.build().unwrap();
        assert_eq!(reg.tests().count(), 1);
        assert_eq!(reg.upgrade_tests().count(), 1);
        assert_eq!(reg.get("fcos.upgrade.basic").unwrap().name, "fcos.upgrade.basic");
    }

    #[test]
    fn test_end_version_must_follow_min() {
        let mut b = RegistryBuilder::new();
        b.register(
            test("coreos.range")
                .min_version(Version::new(1745, 0, 0))
                .end_version(Version::new(1745, 0, 0)),
        );
        assert!(matches!(b.build(), Err(Error::Registration(_))));

        let mut b = RegistryBuilder::new();
        b.register(test("coreos.zero").end_version(Version::new(0, 0, 0)));
        assert!(b.build().is_err());

        let mut b = RegistryBuilder::new();
        b.register(
            test("coreos.range")
                .min_version(Version::new(1745, 0, 0))
                .end_version(Version::new(1800, 0, 0)),
        );
        assert!(b.build().is_ok());
    }

    fn noop() -> NativeFuture {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn test_duplicate_native_func_rejected() {
        const F: NativeFunc = NativeFunc::new("check", noop);
        let mut b = RegistryBuilder::new();
        b.register(test("coreos.native").native(F).native(F));
        assert!(b.build().unwrap_err().to_string().contains("twice"));
    }

    #[test]
    fn test_iteration_is_name_ordered() {
        let mut b = RegistryBuilder::new();
        b.register(test("z.last"))
            .register(test("a.first"))
            .register(test("m.middle"));
        let reg = b.build().unwrap();
        let names: Vec<_> = reg.tests().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a.first", "m.middle", "z.last"]);
        assert!(reg.get("m.middle").is_some());
        assert_eq!(reg.len(), 3);
    }
}
