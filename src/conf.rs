//! First-boot configuration
//!
//! [`UserData`] is the template a test declares; [`Conf`] is what a machine
//! actually boots with after [`UserData::render`]. Butane is translated to
//! Ignition spec 3 for the subset tests use (users, units, files,
//! directories, links, kernel arguments).

use std::fmt;

use serde_json::{json, Map, Value};

use crate::{Error, Result};

/// What to do with non-fatal parser warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarningsAction {
    /// Warnings are render errors
    #[default]
    FailWarnings,
    /// Warnings are logged and otherwise ignored
    IgnoreWarnings,
}

/// Format of a [`UserData`] template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDataKind {
    Ignition,
    Butane,
    CloudConfig,
    Script,
    Empty,
}

/// A first-boot configuration template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    kind: UserDataKind,
    data: String,
    extra_keys: Vec<String>,
}

const IGNITION_TOP_LEVEL: &[&str] = &["ignition", "passwd", "storage", "systemd", "kernelArguments"];

/// Butane fcos spec version to the Ignition spec it emits
const BUTANE_FCOS_VERSIONS: &[(&str, &str)] = &[
    ("1.0.0", "3.0.0"),
    ("1.1.0", "3.1.0"),
    ("1.2.0", "3.2.0"),
    ("1.3.0", "3.2.0"),
    ("1.4.0", "3.3.0"),
    ("1.5.0", "3.4.0"),
];

impl UserData {
    pub fn ignition(data: impl Into<String>) -> Self {
        Self::with_kind(UserDataKind::Ignition, data)
    }

    pub fn butane(data: impl Into<String>) -> Self {
        Self::with_kind(UserDataKind::Butane, data)
    }

    pub fn cloud_config(data: impl Into<String>) -> Self {
        Self::with_kind(UserDataKind::CloudConfig, data)
    }

    pub fn script(data: impl Into<String>) -> Self {
        Self::with_kind(UserDataKind::Script, data)
    }

    pub fn empty() -> Self {
        Self::with_kind(UserDataKind::Empty, "")
    }

    fn with_kind(kind: UserDataKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            extra_keys: Vec::new(),
        }
    }

    pub fn kind(&self) -> UserDataKind {
        self.kind
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.data.contains(needle)
    }

    /// Replace every occurrence of `old` with `new`
    pub fn subst(&self, old: &str, new: &str) -> Self {
        Self {
            data: self.data.replace(old, new),
            ..self.clone()
        }
    }

    /// Authorize an additional SSH public key for the `core` user
    pub fn add_key(&self, key: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.extra_keys.push(key.into());
        out
    }

    /// Parse the template into a bootable configuration
    pub fn render(&self, action: WarningsAction) -> Result<Conf> {
        let mut warnings = Vec::new();
        let mut conf = match self.kind {
            UserDataKind::Empty => Conf::Empty,
            UserDataKind::Ignition => {
                let value: Value = serde_json::from_str(&self.data)
                    .map_err(|e| Error::Render(format!("parsing ignition config: {}", e)))?;
                check_ignition(&value, &mut warnings)?;
                Conf::Ignition(value)
            }
            UserDataKind::Butane => Conf::Ignition(translate_butane(&self.data, &mut warnings)?),
            UserDataKind::CloudConfig => {
                if !self.data.starts_with("#cloud-config") {
                    return Err(Error::Render(
                        "cloud-config must start with #cloud-config".into(),
                    ));
                }
                serde_yaml::from_str::<serde_yaml::Value>(&self.data)
                    .map_err(|e| Error::Render(format!("parsing cloud-config: {}", e)))?;
                Conf::CloudConfig(self.data.clone())
            }
            UserDataKind::Script => {
                if !self.data.starts_with("#!") {
                    return Err(Error::Render("script must start with #!".into()));
                }
                Conf::Script(self.data.clone())
            }
        };

        if !warnings.is_empty() {
            match action {
                WarningsAction::FailWarnings => {
                    return Err(Error::Render(format!(
                        "config has warnings: {}",
                        warnings.join("; ")
                    )));
                }
                WarningsAction::IgnoreWarnings => {
                    for w in &warnings {
                        tracing::warn!("user data: {}", w);
                    }
                }
            }
        }

        if !self.extra_keys.is_empty() {
            conf.add_authorized_keys("core", &self.extra_keys)?;
        }
        Ok(conf)
    }
}

fn check_ignition(value: &Value, warnings: &mut Vec<String>) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::Render("ignition config must be an object".into()))?;
    let version = obj
        .get("ignition")
        .and_then(|i| i.get("version"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Render("ignition config is missing ignition.version".into()))?;
    if !version.starts_with("3.") {
        return Err(Error::Render(format!(
            "unsupported ignition config version {}",
            version
        )));
    }
    for key in obj.keys() {
        if !IGNITION_TOP_LEVEL.contains(&key.as_str()) {
            warnings.push(format!("unused key {}", key));
        }
    }
    Ok(())
}

fn translate_butane(data: &str, warnings: &mut Vec<String>) -> Result<Value> {
    let doc: serde_yaml::Value = serde_yaml::from_str(data)
        .map_err(|e| Error::Render(format!("parsing butane config: {}", e)))?;
    let doc = serde_json::to_value(doc)?;
    let obj = doc
        .as_object()
        .ok_or_else(|| Error::Render("butane config must be a mapping".into()))?;

    let variant = obj.get("variant").and_then(Value::as_str).unwrap_or("");
    if variant != "fcos" {
        return Err(Error::Render(format!("unsupported butane variant {:?}", variant)));
    }
    let version = obj.get("version").and_then(Value::as_str).unwrap_or("");
    let ign_version = BUTANE_FCOS_VERSIONS
        .iter()
        .find(|(b, _)| *b == version)
        .map(|(_, i)| *i)
        .ok_or_else(|| Error::Render(format!("unsupported butane version {:?}", version)))?;

    let mut out = Map::new();
    let mut ignition = obj
        .get("ignition")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    ignition.insert("version".into(), json!(ign_version));
    out.insert("ignition".into(), Value::Object(ignition));

    for (key, value) in obj {
        match key.as_str() {
            "variant" | "version" | "ignition" => {}
            "passwd" | "systemd" => {
                out.insert(key.clone(), camel_case_keys(value));
            }
            "kernel_arguments" => {
                out.insert("kernelArguments".into(), camel_case_keys(value));
            }
            "storage" => {
                out.insert("storage".into(), camel_case_keys(&translate_storage(value)?));
            }
            other => {
                warnings.push(format!("unused key {}", other));
            }
        }
    }
    Ok(Value::Object(out))
}

/// Rename Butane's snake_case keys to Ignition's lowerCamelCase, recursively.
/// Values are left alone.
fn camel_case_keys(value: &Value) -> Value {
    match value {
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (lower_camel(k), camel_case_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(camel_case_keys).collect()),
        other => other.clone(),
    }
}

fn lower_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for ch in key.chars() {
        if ch == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn translate_storage(storage: &Value) -> Result<Value> {
    let mut storage = storage.clone();
    let files = storage
        .get_mut("files")
        .and_then(Value::as_array_mut)
        .map(|f| f.iter_mut());
    for file in files.into_iter().flatten() {
        let Some(contents) = file.get_mut("contents").and_then(Value::as_object_mut) else {
            continue;
        };
        if let Some(inline) = contents.remove("inline") {
            let inline = inline
                .as_str()
                .ok_or_else(|| Error::Render("storage.files contents.inline must be a string".into()))?;
            contents.insert("source".into(), json!(data_url(inline)));
        }
    }
    Ok(storage)
}

/// Encode `contents` as a percent-encoded `data:` URL
pub fn data_url(contents: &str) -> String {
    format!("data:,{}", urlencoding::encode(contents))
}

/// A rendered first-boot configuration
#[derive(Debug, Clone, PartialEq)]
pub enum Conf {
    Ignition(Value),
    CloudConfig(String),
    Script(String),
    Empty,
}

impl Conf {
    pub fn is_ignition(&self) -> bool {
        matches!(self, Conf::Ignition(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Conf::Empty)
    }

    fn ignition_mut(&mut self, what: &str) -> Result<&mut Map<String, Value>> {
        match self {
            Conf::Ignition(Value::Object(obj)) => Ok(obj),
            _ => Err(Error::Unsupported(format!(
                "{} requires an ignition config",
                what
            ))),
        }
    }

    /// Write a file with the given contents and mode on first boot
    pub fn add_file(&mut self, path: &str, contents: &str, mode: u32) -> Result<()> {
        let obj = self.ignition_mut("adding a file")?;
        section_array(obj, "storage", "files")?.push(json!({
            "path": path,
            "contents": { "source": data_url(contents) },
            "mode": mode,
            "overwrite": true,
        }));
        Ok(())
    }

    /// Install (and optionally enable) a systemd unit
    pub fn add_systemd_unit(&mut self, name: &str, contents: &str, enabled: bool) -> Result<()> {
        let obj = self.ignition_mut("adding a systemd unit")?;
        section_array(obj, "systemd", "units")?.push(json!({
            "name": name,
            "contents": contents,
            "enabled": enabled,
        }));
        Ok(())
    }

    /// Authorize SSH keys for `user`. An empty config becomes a minimal
    /// Ignition config; scripts are left untouched.
    pub fn add_authorized_keys(&mut self, user: &str, keys: &[String]) -> Result<()> {
        if self.is_empty() {
            *self = Conf::Ignition(json!({ "ignition": { "version": "3.0.0" } }));
        }
        match self {
            Conf::Ignition(Value::Object(obj)) => {
                let users = section_array(obj, "passwd", "users")?;
                let idx = match users
                    .iter()
                    .position(|u| u.get("name").and_then(Value::as_str) == Some(user))
                {
                    Some(idx) => idx,
                    None => {
                        users.push(json!({ "name": user }));
                        users.len() - 1
                    }
                };
                let entry = users[idx]
                    .as_object_mut()
                    .ok_or_else(|| Error::Render("passwd.users entries must be objects".into()))?;
                let existing = entry
                    .entry("sshAuthorizedKeys")
                    .or_insert_with(|| json!([]));
                if let Value::Array(list) = existing {
                    list.extend(keys.iter().map(|k| json!(k)));
                }
                Ok(())
            }
            Conf::Ignition(_) => Err(Error::Render("ignition config must be an object".into())),
            Conf::CloudConfig(text) => {
                let mut doc: serde_yaml::Value = serde_yaml::from_str(text)
                    .map_err(|e| Error::Render(format!("parsing cloud-config: {}", e)))?;
                if doc.is_null() {
                    doc = serde_yaml::Value::Mapping(Default::default());
                }
                let map = doc
                    .as_mapping_mut()
                    .ok_or_else(|| Error::Render("cloud-config must be a mapping".into()))?;
                let list = map
                    .entry("ssh_authorized_keys".into())
                    .or_insert_with(|| serde_yaml::Value::Sequence(Vec::new()));
                if let serde_yaml::Value::Sequence(seq) = list {
                    seq.extend(keys.iter().map(|k| serde_yaml::Value::String(k.clone())));
                }
                *text = format!("#cloud-config\n{}", serde_yaml::to_string(&doc)?);
                Ok(())
            }
            Conf::Script(_) | Conf::Empty => Ok(()),
        }
    }
}

fn section_array<'a>(
    obj: &'a mut Map<String, Value>,
    section: &str,
    list: &str,
) -> Result<&'a mut Vec<Value>> {
    obj.entry(section)
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .and_then(|s| s.entry(list).or_insert_with(|| json!([])).as_array_mut())
        .ok_or_else(|| Error::Render(format!("{}.{} must be a list", section, list)))
}

impl fmt::Display for Conf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conf::Ignition(value) => write!(f, "{}", value),
            Conf::CloudConfig(text) | Conf::Script(text) => write!(f, "{}", text),
            Conf::Empty => Ok(()),
        }
    }
}
