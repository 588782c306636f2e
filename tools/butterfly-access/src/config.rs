//! Property source and run configuration
//!
//! Properties are read from a TOML file; dotted keys (`acc.packet_size`) walk
//! nested tables. They are consulted during setup only.

use std::fs;
use std::path::{Path, PathBuf};

use butterfly_common::{suggest_name, Error, Result};
use log::debug;
use toml::{Table, Value};

use crate::partition::DEFAULT_PACKET_SIZE;
use crate::size_terms::MARKET_SEGMENTS;
use crate::table::DEFAULT_INDEX_LABEL;

/// Typed access to configuration properties
pub trait PropertySource {
    fn contains(&self, key: &str) -> bool;
    fn read_string(&self, key: &str) -> Result<String>;
    fn read_int(&self, key: &str) -> Result<i64>;
    fn read_float(&self, key: &str) -> Result<f64>;
    fn read_bool(&self, key: &str) -> Result<bool>;
    fn read_int_array(&self, key: &str) -> Result<Vec<i64>>;
    fn read_float_array(&self, key: &str) -> Result<Vec<f64>>;
    fn read_string_array(&self, key: &str) -> Result<Vec<String>>;

    fn read_string_or(&self, key: &str, default: &str) -> Result<String> {
        if self.contains(key) {
            self.read_string(key)
        } else {
            Ok(default.to_string())
        }
    }

    fn read_int_or(&self, key: &str, default: i64) -> Result<i64> {
        if self.contains(key) {
            self.read_int(key)
        } else {
            Ok(default)
        }
    }

    fn read_float_or(&self, key: &str, default: f64) -> Result<f64> {
        if self.contains(key) {
            self.read_float(key)
        } else {
            Ok(default)
        }
    }

    fn read_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        if self.contains(key) {
            self.read_bool(key)
        } else {
            Ok(default)
        }
    }
}

/// TOML-backed properties
#[derive(Debug, Clone, Default)]
pub struct Properties {
    root: Table,
    base_dir: Option<PathBuf>,
}

fn type_error(key: &str, expected: &str, value: &Value) -> Error {
    Error::Configuration(format!(
        "property '{key}' should be {expected}, found {}",
        value.type_str()
    ))
}

fn collect_keys(table: &Table, prefix: &str, out: &mut Vec<String>) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            Value::Table(inner) => collect_keys(inner, &key, out),
            _ => out.push(key),
        }
    }
}

impl Properties {
    pub fn parse(text: &str) -> Result<Self> {
        let root: Table = text
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid TOML: {e}")))?;
        Ok(Self {
            root,
            base_dir: None,
        })
    }

    /// Load a file; relative paths in it resolve against its directory
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut props = Self::parse(&text)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
        props.base_dir = path.parent().map(Path::to_path_buf);
        debug!("Loaded properties from {}", path.display());
        Ok(props)
    }

    /// All leaf keys in dotted form
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        collect_keys(&self.root, "", &mut keys);
        keys.sort();
        keys
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        let mut parts = key.split('.');
        let first = parts.next()?;
        let mut value = self.root.get(first)?;
        for part in parts {
            value = value.as_table()?.get(part)?;
        }
        Some(value)
    }

    fn require(&self, key: &str) -> Result<&Value> {
        self.lookup(key).ok_or_else(|| {
            let keys = self.keys();
            match suggest_name(key, &keys) {
                Some(candidate) => Error::Configuration(format!(
                    "missing property '{key}' (did you mean '{candidate}'?)"
                )),
                None => Error::Configuration(format!("missing property '{key}'")),
            }
        })
    }

    fn read_array<T>(
        &self,
        key: &str,
        expected: &str,
        convert: impl Fn(&Value) -> Option<T>,
    ) -> Result<Vec<T>> {
        let value = self.require(key)?;
        let items = value
            .as_array()
            .ok_or_else(|| type_error(key, expected, value))?;
        items
            .iter()
            .map(|item| convert(item).ok_or_else(|| type_error(key, expected, item)))
            .collect()
    }

    /// Path property, resolved against the properties file directory
    pub fn read_path(&self, key: &str) -> Result<PathBuf> {
        let path = PathBuf::from(self.read_string(key)?);
        Ok(match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        })
    }
}

impl PropertySource for Properties {
    fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    fn read_string(&self, key: &str) -> Result<String> {
        let value = self.require(key)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| type_error(key, "a string", value))
    }

    fn read_int(&self, key: &str) -> Result<i64> {
        let value = self.require(key)?;
        value
            .as_integer()
            .ok_or_else(|| type_error(key, "an integer", value))
    }

    fn read_float(&self, key: &str) -> Result<f64> {
        let value = self.require(key)?;
        value
            .as_float()
            .or_else(|| value.as_integer().map(|i| i as f64))
            .ok_or_else(|| type_error(key, "a number", value))
    }

    fn read_bool(&self, key: &str) -> Result<bool> {
        let value = self.require(key)?;
        value
            .as_bool()
            .ok_or_else(|| type_error(key, "a boolean", value))
    }

    fn read_int_array(&self, key: &str) -> Result<Vec<i64>> {
        self.read_array(key, "an array of integers", Value::as_integer)
    }

    fn read_float_array(&self, key: &str) -> Result<Vec<f64>> {
        self.read_array(key, "an array of numbers", |v| {
            v.as_float().or_else(|| v.as_integer().map(|i| i as f64))
        })
    }

    fn read_string_array(&self, key: &str) -> Result<Vec<String>> {
        self.read_array(key, "an array of strings", |v| v.as_str().map(str::to_string))
    }
}

/// Where packets run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Local { threads: usize },
    Distributed { nodes: usize },
}

/// Cache dimensions that do not depend on the zone file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheDims {
    pub max_tap: u32,
    pub segments: u32,
    pub periods: u32,
}

/// Configuration for an accessibility build
#[derive(Debug, Clone, PartialEq)]
pub struct AccessConfig {
    pub zone_file: PathBuf,
    pub output_file: PathBuf,
    pub index_label: String,
    pub packet_size: usize,
    pub executor: ExecutorKind,
    pub cache: CacheDims,
    /// Zone attributes used as general size term segments (one alternative each)
    pub size_attributes: Vec<String>,
    /// Five school size attributes, see `SCHOOL_SIZE_ALTERNATIVES`
    pub school_size_attributes: Option<Vec<String>>,
    pub enrollment_attribute: Option<String>,
    /// Six occupation size attributes in occupation order
    pub work_size_attributes: Option<Vec<String>>,
    pub modes: Vec<String>,
    /// Constants per market segment, `MARKET_SEGMENTS + 1` rows
    pub constants: Vec<Vec<f64>>,
    pub decay: f64,
    pub market_segment: usize,
}

fn non_negative(key: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::Configuration(format!("property '{key}' must not be negative")))
}

fn optional_strings(props: &impl PropertySource, key: &str) -> Result<Option<Vec<String>>> {
    if props.contains(key) {
        props.read_string_array(key).map(Some)
    } else {
        Ok(None)
    }
}

impl AccessConfig {
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let packet_size = non_negative(
            "acc.packet_size",
            props.read_int_or("acc.packet_size", DEFAULT_PACKET_SIZE as i64)?,
        )? as usize;
        if packet_size == 0 {
            return Err(Error::Configuration(
                "acc.packet_size must be at least 1".to_string(),
            ));
        }

        let executor = if props.read_bool_or("acc.distributed", false)? {
            let nodes = non_negative("acc.nodes", props.read_int_or("acc.nodes", 2)?)? as usize;
            ExecutorKind::Distributed { nodes }
        } else {
            let threads = non_negative(
                "acc.threads",
                props.read_int_or("acc.threads", num_cpus::get() as i64)?,
            )? as usize;
            ExecutorKind::Local { threads }
        };

        let dim = |key: &str, default: i64| -> Result<u32> {
            let value = non_negative(key, props.read_int_or(key, default)?)?;
            u32::try_from(value)
                .map_err(|_| Error::Configuration(format!("property '{key}' is too large")))
        };
        let cache = CacheDims {
            max_tap: dim("cache.max_tap", 0)?,
            segments: dim("cache.segments", 1)?,
            periods: dim("cache.periods", 1)?,
        };

        let modes = props.read_string_array("constants.modes")?;
        let constants = (0..=MARKET_SEGMENTS)
            .map(|m| props.read_float_array(&format!("constants.market_{m}")))
            .collect::<Result<Vec<_>>>()?;

        let school_size_attributes = optional_strings(props, "school.size_attributes")?;
        if let Some(attrs) = &school_size_attributes {
            if attrs.len() != 5 {
                return Err(Error::Configuration(format!(
                    "school.size_attributes needs 5 entries, found {}",
                    attrs.len()
                )));
            }
        }
        let work_size_attributes = optional_strings(props, "work.size_attributes")?;
        if let Some(attrs) = &work_size_attributes {
            if attrs.len() != 6 {
                return Err(Error::Configuration(format!(
                    "work.size_attributes needs 6 entries, found {}",
                    attrs.len()
                )));
            }
        }
        let enrollment_attribute = if props.contains("school.enrollment_attribute") {
            Some(props.read_string("school.enrollment_attribute")?)
        } else {
            None
        };

        let market_segment = non_negative(
            "gravity.market_segment",
            props.read_int_or("gravity.market_segment", MARKET_SEGMENTS as i64)?,
        )? as usize;
        if market_segment > MARKET_SEGMENTS {
            return Err(Error::Configuration(format!(
                "gravity.market_segment must be in 0..={MARKET_SEGMENTS}"
            )));
        }

        Ok(Self {
            zone_file: props.read_path("acc.zone_file")?,
            output_file: props.read_path("acc.output_file")?,
            index_label: props.read_string_or("acc.index_label", DEFAULT_INDEX_LABEL)?,
            packet_size,
            executor,
            cache,
            size_attributes: props.read_string_array("size.attributes")?,
            school_size_attributes,
            enrollment_attribute,
            work_size_attributes,
            modes,
            constants,
            decay: props.read_float_or("gravity.decay", 1.0)?,
            market_segment,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_properties(&Properties::load(path)?)
    }
}
