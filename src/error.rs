use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    InvalidPackage(String),
    InvalidDocx(String),
    InvalidXlsx(String),
    Config(String),
    SamePath(PathBuf),
    UnsupportedFormat(PathBuf),
    Zip(zip::result::ZipError),
    Xml(roxmltree::Error),
    Json(serde_json::Error),
    Pattern(regex::Error),
    Matcher(aho_corasick::BuildError),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidPackage(reason) => write!(f, "not a valid OOXML package: {reason}"),
            Error::InvalidDocx(reason) => write!(f, "not a valid DOCX file: {reason}"),
            Error::InvalidXlsx(reason) => write!(f, "not a valid XLSX file: {reason}"),
            Error::Config(reason) => write!(f, "invalid merge configuration: {reason}"),
            Error::SamePath(path) => write!(
                f,
                "refusing to overwrite the template itself: {}",
                path.display()
            ),
            Error::UnsupportedFormat(path) => {
                write!(f, "unsupported template format: {}", path.display())
            }
            Error::Zip(e) => write!(f, "ZIP error: {e}"),
            Error::Xml(e) => write!(f, "XML error: {e}"),
            Error::Json(e) => write!(f, "JSON error: {e}"),
            Error::Pattern(e) => write!(f, "invalid token pattern: {e}"),
            Error::Matcher(e) => write!(f, "cannot build token matcher: {e}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Zip(e) => Some(e),
            Error::Xml(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Pattern(e) => Some(e),
            Error::Matcher(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Zip(e)
    }
}

impl From<roxmltree::Error> for Error {
    fn from(e: roxmltree::Error) -> Self {
        Error::Xml(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::Pattern(e)
    }
}

impl From<aho_corasick::BuildError> for Error {
    fn from(e: aho_corasick::BuildError) -> Self {
        Error::Matcher(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(e: tempfile::PersistError) -> Self {
        Error::Io(e.error)
    }
}
