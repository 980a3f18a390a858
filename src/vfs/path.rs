//! Archive path handling.

use crate::error::{Error, Result};
use std::fmt;

/// A validated absolute path inside the archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VfsPath {
    components: Vec<String>,
}

impl VfsPath {
    /// The root directory.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parse a path string.
    ///
    /// Paths must be absolute. Repeated and trailing separators are ignored;
    /// `.` and `..` components are rejected.
    pub fn parse(path: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(Error::InvalidPath(format!(
                "{}: path must be absolute (start with /)",
                path
            )));
        }

        let mut parsed = Self::root();
        for component in path.split('/').filter(|s| !s.is_empty()) {
            parsed.push(component)?;
        }
        Ok(parsed)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Get the parent path.
    pub fn parent(&self) -> Option<Self> {
        self.components.split_last().map(|(_, rest)| Self {
            components: rest.to_vec(),
        })
    }

    /// Split into parent path and final name; `None` for the root.
    pub fn split(&self) -> Option<(Self, &str)> {
        self.components.split_last().map(|(name, rest)| {
            (
                Self {
                    components: rest.to_vec(),
                },
                name.as_str(),
            )
        })
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join a child path component.
    pub fn join(&self, name: &str) -> Result<Self> {
        let mut joined = self.clone();
        joined.push(name)?;
        Ok(joined)
    }

    fn push(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." || name.contains('\0') {
            return Err(Error::InvalidPath(format!("invalid path component: {:?}", name)));
        }
        self.components.push(name.to_string());
        Ok(())
    }

    /// Get the depth of this path.
    pub fn depth(&self) -> usize {
        self.components.len()
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}
