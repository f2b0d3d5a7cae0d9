//! Objects a child process persists on disk and references by path
//!
//! Module boundaries and log associations don't travel inline. The child writes a module context
//! or a log file descriptor to disk and only reports its path. The parser reads these back through
//! an `ObjectStore`, which keeps the concrete serialization format out of the dispatch logic.
//! `JsonStore` is the default, JSON backed implementation.
//!

// standard library
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

// third party
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// local
use crate::error::{Error, Result};

/// Kind of data a log file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogDataType {
    /// Plain text
    Text,
    /// Android logcat
    Logcat,
    /// Android bugreport
    Bugreport,
    /// XML document
    Xml,
    /// HTML document
    Html,
    /// PNG image
    Png,
    /// JPEG image
    Jpeg,
    /// Zip archive
    Zip,
    /// Gzip archive
    Gzip,
    /// Protocol buffer
    Pb,
    /// Anything else
    Unknown,
}

impl LogDataType {
    /// Wire name of the data type
    pub fn as_str(self) -> &'static str {
        match self {
            LogDataType::Text => "TEXT",
            LogDataType::Logcat => "LOGCAT",
            LogDataType::Bugreport => "BUGREPORT",
            LogDataType::Xml => "XML",
            LogDataType::Html => "HTML",
            LogDataType::Png => "PNG",
            LogDataType::Jpeg => "JPEG",
            LogDataType::Zip => "ZIP",
            LogDataType::Gzip => "GZIP",
            LogDataType::Pb => "PB",
            LogDataType::Unknown => "UNKNOWN",
        }
    }
}

impl Default for LogDataType {
    fn default() -> Self {
        LogDataType::Unknown
    }
}

impl fmt::Display for LogDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogDataType {
    type Err = Error;

    /// Parse a data type, unknown names map to `LogDataType::Unknown`
    fn from_str(s: &str) -> Result<Self> {
        let data_type = match s.to_ascii_uppercase().as_str() {
            "TEXT" => LogDataType::Text,
            "LOGCAT" => LogDataType::Logcat,
            "BUGREPORT" => LogDataType::Bugreport,
            "XML" => LogDataType::Xml,
            "HTML" => LogDataType::Html,
            "PNG" => LogDataType::Png,
            "JPEG" => LogDataType::Jpeg,
            "ZIP" => LogDataType::Zip,
            "GZIP" => LogDataType::Gzip,
            "PB" => LogDataType::Pb,
            _ => LogDataType::Unknown,
        };
        Ok(data_type)
    }
}

/// Identity and attributes of a test module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleContext {
    /// Module identifier
    pub id: String,
    /// Module attributes, a key may hold several values
    #[serde(default)]
    pub attributes: std::collections::BTreeMap<String, Vec<String>>,
}

impl ModuleContext {
    /// Create a module context without attributes
    pub fn new<T: Into<String>>(id: T) -> Self {
        ModuleContext {
            id: id.into(),
            attributes: Default::default(),
        }
    }

    /// Add an attribute value (multimap semantics)
    pub fn add_attribute<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.attributes
            .entry(key.into())
            .or_insert_with(Vec::new)
            .push(value.into());
    }
}

/// Descriptor of a log file saved by the child process
///
/// A descriptor with a `url` has already been uploaded somewhere and only needs to be associated.
/// Without one, the raw bytes at `path` still have to be reported.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFile {
    /// Local path of the logged data
    pub path: PathBuf,
    /// Remote location, if uploaded
    #[serde(default)]
    pub url: Option<String>,
    /// Kind of logged data
    #[serde(default)]
    pub data_type: LogDataType,
    /// Whether `path` is a zip archive holding the data
    #[serde(default)]
    pub compressed: bool,
    /// Size in bytes, if known
    #[serde(default)]
    pub size: Option<u64>,
}

impl LogFile {
    /// Create a descriptor of a local, uncompressed log
    pub fn new<P: Into<PathBuf>>(path: P, data_type: LogDataType) -> Self {
        LogFile {
            path: path.into(),
            url: None,
            data_type,
            compressed: false,
            size: None,
        }
    }

    /// Whether the file has a non-empty remote location
    pub fn has_url(&self) -> bool {
        self.url.as_deref().map_or(false, |url| !url.trim().is_empty())
    }

    /// Read the logged bytes, unpacking an archived log transparently
    ///
    /// Archived logs are expected to hold exactly one entry. For archives with more entries, the
    /// first one is taken.
    ///
    pub fn read_data(&self) -> Result<Vec<u8>> {
        if !self.compressed {
            return Ok(fs::read(&self.path)?);
        }

        let file = fs::File::open(&self.path)?;
        let mut archive = zip::ZipArchive::new(io::BufReader::new(file))?;

        match archive.len() {
            0 => {
                return Err(Error::ArchiveError(format!(
                    "{:?} is an empty archive",
                    self.path
                )))
            }
            1 => (),
            n => warn!(
                "{:?} holds {} entries instead of one, only the first is reported",
                self.path, n
            ),
        }

        let mut entry = archive.by_index(0)?;
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;

        Ok(data)
    }
}

/// Read access to objects referenced from the event stream
pub trait ObjectStore: Send {
    /// Load the module context at the given path
    fn load_module_context(&self, path: &Path) -> Result<ModuleContext>;

    /// Load the log file descriptor at the given path
    fn load_log_file(&self, path: &Path) -> Result<LogFile>;
}

impl<'a> ObjectStore for Box<dyn ObjectStore + 'a> {
    fn load_module_context(&self, path: &Path) -> Result<ModuleContext> {
        self.as_ref().load_module_context(path)
    }

    fn load_log_file(&self, path: &Path) -> Result<LogFile> {
        self.as_ref().load_log_file(path)
    }
}

/// Objects stored as JSON documents
#[derive(Debug, Clone, Default)]
pub struct JsonStore;

impl JsonStore {
    fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let failure = |message: String| Error::DeserializationError {
            path: path.display().to_string(),
            message,
        };

        let bytes = fs::read(path).map_err(|e| failure(format!("{}", e)))?;
        serde_json::from_slice(&bytes).map_err(|e| failure(format!("{}", e)))
    }

    fn save<T: Serialize>(&self, value: &T, path: &Path) -> Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer(io::BufWriter::new(file), value)?;
        Ok(())
    }

    /// Persist a module context so that a parser can pick it up
    pub fn save_module_context(&self, context: &ModuleContext, path: &Path) -> Result<()> {
        self.save(context, path)
    }

    /// Persist a log file descriptor so that a parser can pick it up
    pub fn save_log_file(&self, log_file: &LogFile, path: &Path) -> Result<()> {
        self.save(log_file, path)
    }
}

impl ObjectStore for JsonStore {
    fn load_module_context(&self, path: &Path) -> Result<ModuleContext> {
        self.load(path)
    }

    fn load_log_file(&self, path: &Path) -> Result<LogFile> {
        self.load(path)
    }
}
