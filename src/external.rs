//! External Tests
//!
//! Tests can live outside the binary as executables under
//! `<dir>/tests/kola`. Every directory below that root becomes a test
//! namespace: `tests/kola/files/test.sh` in `/srv/config` registers
//! `ext.config.files`, and any other executable name is appended
//! (`ext.config.files.license`).
//!
//! A directory may also hold:
//! - `config.ign` or `config.bu`: first-boot configuration
//! - `kola.json`: metadata for every executable in the directory
//! - `data/`: uploaded to [`EXT_DATA_DIR`] on the machine
//!
//! Executables can carry their own metadata in a header comment, either
//! one line of JSON:
//!
//! ```text
//! # kola: { "tags": "ignition", "architectures": "!s390x" }
//! ```
//!
//! or a YAML block:
//!
//! ```text
//! ## kola:
//! ##   tags: ignition
//! ##   architectures: "!s390x"
//! ```
//!
//! Platform, distro and architecture lists are space separated; a leading
//! `!` turns the list into an exclusion.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::conf::{UserData, WarningsAction};
use crate::register::{Flag, Test};
use crate::registry::RegistryBuilder;
use crate::{Error, Result};

/// Root of external tests inside a test directory
pub const TESTS_SUBDIR: &str = "tests/kola";
/// Executable name that doesn't extend the test name
pub const DEFAULT_TEST: &str = "test.sh";
/// Name of the dependency data directory next to a test
pub const DATA_DIR: &str = "data";
/// Where dependency data lands on the machine
pub const EXT_DATA_DIR: &str = "/var/opt/kola/extdata";
/// Environment variable pointing the test at [`EXT_DATA_DIR`]
pub const EXT_DATA_ENV: &str = "KOLA_EXT_DATA";
/// Tag carried by every external test
pub const EXTERNAL_TAG: &str = "external";

const META_PREFIX: &str = "# kola:";
const META_PREFIX_YAML: &str = "## kola:";
// Only the head of an executable is searched for metadata
const META_SCAN_LIMIT: u64 = 8192;

/// Metadata from `kola.json` or an executable's header
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ExternalTestMeta {
    pub architectures: String,
    pub platforms: String,
    pub distros: String,
    pub tags: String,
    pub required_tag: String,
    pub additional_disks: Vec<String>,
    pub min_memory: usize,
    #[serde(rename = "minDisk")]
    pub min_disk_size: usize,
    pub additional_nics: usize,
    pub append_kernel_args: String,
    /// Accepted for compatibility; every test gets its own machine
    pub exclusive: bool,
    pub allow_config_warnings: bool,
    pub no_instance_creds: bool,
    pub description: String,
}

impl Default for ExternalTestMeta {
    fn default() -> Self {
        Self {
            architectures: String::new(),
            platforms: String::new(),
            distros: String::new(),
            tags: String::new(),
            required_tag: String::new(),
            additional_disks: Vec::new(),
            min_memory: 0,
            min_disk_size: 0,
            additional_nics: 0,
            append_kernel_args: String::new(),
            exclusive: true,
            allow_config_warnings: false,
            no_instance_creds: false,
            description: String::new(),
        }
    }
}

impl ExternalTestMeta {
    /// Read header metadata from `executable`, `None` if it has none
    pub fn from_executable(executable: &Path) -> Result<Option<Self>> {
        let file = fs::File::open(executable)?;
        Self::from_reader(BufReader::new(file.take(META_SCAN_LIMIT)))
            .map_err(|e| Error::Registration(format!("parsing metadata from {}: {}", executable.display(), e)))
    }

    fn from_reader(reader: impl BufRead) -> Result<Option<Self>> {
        let mut yaml: Option<String> = None;
        for line in reader.lines() {
            let line = line?;
            if let Some(json) = line.strip_prefix(META_PREFIX) {
                if yaml.is_some() {
                    return Err(Error::Config(format!(
                        "found both {:?} and {:?} metadata",
                        META_PREFIX_YAML, META_PREFIX
                    )));
                }
                return Ok(Some(serde_json::from_str(json.trim())?));
            }
            if line.starts_with(META_PREFIX_YAML) {
                if yaml.is_some() {
                    return Err(Error::Config(format!("found multiple {:?}", META_PREFIX_YAML)));
                }
                yaml = Some(String::new());
            } else if let Some(buf) = yaml.as_mut() {
                match line.strip_prefix("## ") {
                    Some(rest) => {
                        buf.push_str(rest);
                        buf.push('\n');
                    }
                    None => break,
                }
            }
        }
        match yaml {
            Some(buf) => Ok(Some(serde_yaml::from_str(&buf)?)),
            None => Ok(None),
        }
    }
}

/// Split `"!a b"` into (allow, deny) lists
fn allow_deny(list: &str) -> (Vec<String>, Vec<String>) {
    match list.trim().strip_prefix('!') {
        Some(rest) => (Vec::new(), fields(rest)),
        None => (fields(list), Vec::new()),
    }
}

fn fields(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.is_file() && meta.permissions().mode() & 0o001 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Register the tests under `<dir>/tests/kola` as `ext.<dir name>.*`
pub fn register_external_tests(builder: &mut RegistryBuilder, dir: &Path) -> Result<usize> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("bad external test directory {}", dir.display())))?;
    register_external_tests_with_prefix(builder, dir, &format!("ext.{}", name))
}

/// Register the tests under `<dir>/tests/kola` with names starting with
/// `prefix`. A missing test root registers nothing.
pub fn register_external_tests_with_prefix(
    builder: &mut RegistryBuilder,
    dir: &Path,
    prefix: &str,
) -> Result<usize> {
    let root = dir.join(TESTS_SUBDIR);
    if !root.is_dir() {
        tracing::debug!(dir = %root.display(), "no external tests");
        return Ok(0);
    }
    let mut tests = Vec::new();
    scan_dir(&root, prefix, &mut tests)?;
    let count = tests.len();
    for test in tests {
        tracing::debug!(test = %test.name, "registering external test");
        builder.register(test);
    }
    Ok(count)
}

fn scan_dir(dir: &Path, prefix: &str, out: &mut Vec<Test>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut user_data = UserData::empty();
    let mut base_meta = ExternalTestMeta::default();
    let mut data_dir = None;
    let mut executables = Vec::new();

    for entry in entries {
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().to_string();
        // follows symlinks
        let meta = fs::metadata(&path)?;

        if meta.is_dir() {
            if file_name == DATA_DIR {
                data_dir = Some(fs::canonicalize(&path)?);
            } else {
                scan_dir(&path, &format!("{}.{}", prefix, file_name), out)?;
            }
        } else if is_executable(&meta) {
            executables.push(path);
        } else if meta.is_file() {
            match file_name.as_str() {
                "config.ign" => user_data = UserData::ignition(fs::read_to_string(&path)?),
                "config.bu" => user_data = UserData::butane(fs::read_to_string(&path)?),
                "config.fcc" => {
                    return Err(Error::Registration(format!(
                        "{} is not supported anymore; rename it to config.bu",
                        path.display()
                    )))
                }
                "kola.json" => {
                    base_meta = serde_json::from_str(&fs::read_to_string(&path)?).map_err(|e| {
                        Error::Registration(format!("parsing {}: {}", path.display(), e))
                    })?;
                }
                _ => {
                    if fs::read_to_string(&path)
                        .map(|s| s.starts_with("#!"))
                        .unwrap_or(false)
                    {
                        tracing::warn!(file = %path.display(), "found non-executable file with shebang");
                    }
                }
            }
        }
    }

    let single = executables.len() == 1;
    for executable in executables {
        let base = executable
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let name = if single && base == DEFAULT_TEST {
            prefix.to_string()
        } else {
            format!("{}.{}", prefix, base)
        };
        let meta = ExternalTestMeta::from_executable(&executable)?.unwrap_or_else(|| base_meta.clone());
        out.push(external_test(&name, &executable, data_dir.as_deref(), &user_data, meta)?);
    }
    Ok(())
}

/// Build the descriptor for one external executable
pub fn external_test(
    name: &str,
    executable: &Path,
    data_dir: Option<&Path>,
    user_data: &UserData,
    meta: ExternalTestMeta,
) -> Result<Test> {
    let warnings = if meta.allow_config_warnings {
        WarningsAction::IgnoreWarnings
    } else {
        WarningsAction::FailWarnings
    };
    // Reject broken configs at registration rather than at boot
    user_data
        .render(warnings)
        .map_err(|e| Error::Registration(format!("test {}: {}", name, e)))?;
    if !meta.exclusive {
        tracing::debug!(test = name, "non-exclusive test will get its own machine");
    }

    let base = executable
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Registration(format!("bad executable path {}", executable.display())))?
        .to_string();
    let command = format!(
        "sudo ./kolet run-ext {} {}",
        shell_words::quote(name),
        shell_words::quote(&format!("./{}", base))
    );

    let mut test = Test::new(name, move |c| {
        let command = command.clone();
        async move {
            let m = c.machine(0)?;
            let out = m
                .ssh(&command)
                .await
                .map_err(|e| c.fatal(format!("kolet failed: {}", e)))?;
            let stdout = out.stdout_str();
            if !stdout.trim().is_empty() {
                c.log(stdout.trim_end().to_string());
            }
            if !out.success() {
                return Err(c.fatal(format!(
                    "kolet failed: exit status {}: {}",
                    out.exit_code,
                    out.stderr_str().trim()
                )));
            }
            Ok(())
        }
    })
    .description(meta.description.clone())
    .cluster_size(1)
    .external_test(executable)
    .user_data(user_data.clone());

    let (allow, deny) = allow_deny(&meta.architectures);
    test.architectures = allow;
    test.exclude_architectures = deny;
    let (allow, deny) = allow_deny(&meta.platforms);
    test.platforms = allow;
    test.exclude_platforms = deny;
    let (allow, deny) = allow_deny(&meta.distros);
    test.distros = allow;
    test.exclude_distros = deny;

    test.tags = std::iter::once(EXTERNAL_TAG.to_string())
        .chain(fields(&meta.tags))
        .collect();
    if !meta.required_tag.is_empty() {
        test = test.required_tag(meta.required_tag.clone());
    }
    if meta.no_instance_creds {
        test = test.flag(Flag::NoInstanceCreds);
    }
    if meta.allow_config_warnings {
        test = test.flag(Flag::AllowConfigWarnings);
    }
    test.additional_disks = meta.additional_disks;
    test.min_memory = (meta.min_memory > 0).then_some(meta.min_memory);
    test.min_disk_size = (meta.min_disk_size > 0).then_some(meta.min_disk_size);
    test.additional_nics = meta.additional_nics;
    if !meta.append_kernel_args.is_empty() {
        test = test.append_kernel_args(meta.append_kernel_args);
    }
    if let Some(dir) = data_dir {
        test = test.dependency_dir(PathBuf::from(dir), EXT_DATA_DIR);
    }
    Ok(test)
}
