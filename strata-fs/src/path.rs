//! Path resolver: string path → inode, absolute or CWD-relative (spec.md
//! §4.6, C6). Standardizes on CWD-relative resolution per spec.md §9 (one
//! of two `filesys.c` variants in the source material; the other,
//! root-relative-only, is not implemented).
use std::sync::Arc;

use strata_core::error::{KernelError, Result};
use strata_core::facade::SectorId;

use crate::directory::Directory;
use crate::inode::{Inode, InodeTable};

/// The outcome of a successful path resolution.
pub enum Resolved {
    /// The full path resolved to an existing inode, opened with `+1`
    /// reference; the caller must close it.
    Found(Arc<Inode>),
    /// Every component but the last resolved; `parent` (opened, `+1`
    /// reference) is the directory in which `name` would be created.
    MissingLast { parent: Arc<Inode>, name: String },
}

pub struct PathResolver {
    table: Arc<InodeTable>,
    root_sector: SectorId,
    name_max: usize,
}

impl PathResolver {
    pub fn new(table: Arc<InodeTable>, root_sector: SectorId, name_max: usize) -> PathResolver {
        PathResolver { table, root_sector, name_max }
    }

    pub fn root_sector(&self) -> SectorId {
        self.root_sector
    }

    /// Resolves `path` starting from `cwd` (ignored if `path` is
    /// absolute).
    pub fn resolve(&self, path: &str, cwd: SectorId) -> Result<Resolved> {
        let tokens = split_path(path, self.name_max)?;

        let start = if path.starts_with('/') { self.root_sector } else { cwd };
        let mut current = self.table.open(start)?;

        if tokens.is_empty() {
            return Ok(Resolved::Found(current));
        }

        for (i, tok) in tokens.iter().enumerate() {
            if !current.is_dir() {
                self.table.close(current.sector())?;
                return Err(KernelError::NotDirectory);
            }
            let dir = Directory::new(Arc::clone(&current));
            let found = dir.lookup(tok)?;
            let is_last = i == tokens.len() - 1;

            match found {
                Some(next_sector) => {
                    let next = self.table.open(next_sector)?;
                    self.table.close(current.sector())?;
                    current = next;
                    if is_last {
                        return Ok(Resolved::Found(current));
                    }
                }
                None => {
                    if is_last {
                        return Ok(Resolved::MissingLast {
                            parent: current,
                            name: tok.clone(),
                        });
                    }
                    self.table.close(current.sector())?;
                    return Err(KernelError::NotFound);
                }
            }
        }

        Ok(Resolved::Found(current))
    }
}

fn split_path(path: &str, name_max: usize) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    for tok in path.split('/') {
        if tok.is_empty() {
            continue;
        }
        if tok.len() > name_max {
            return Err(KernelError::InvalidArgument);
        }
        tokens.push(tok.to_string());
    }
    Ok(tokens)
}
