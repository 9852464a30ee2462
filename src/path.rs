//! Confines an FTP argument to a single, direct child of the server root.
//!
//! The original walks the requested name by hand looking for `..` and `/`;
//! here we lean on `Path::components` to do the lexical normalization
//! (collapsing `.` segments, recognizing `..` and absolute prefixes as
//! distinct component kinds) and simply reject anything that isn't exactly
//! one `Normal` component.

use std::path::{Path, PathBuf};

/// Resolves `arg` against `root`, rejecting traversal outside of `root`
/// and any path with more than one component. Returns the path to open,
/// not yet checked for existence.
pub fn resolve(root: &Path, arg: &str) -> Result<PathBuf, ()> {
    let mut normal = None;
    for component in Path::new(arg).components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::Normal(part) => {
                if normal.replace(part).is_some() {
                    return Err(());
                }
            }
            std::path::Component::ParentDir
            | std::path::Component::RootDir
            | std::path::Component::Prefix(_) => return Err(()),
        }
    }
    match normal {
        Some(part) if !part.is_empty() => Ok(root.join(part)),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_plain_file_name() {
        assert_eq!(
            resolve(Path::new("/srv"), "report.txt").unwrap(),
            PathBuf::from("/srv/report.txt")
        );
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(resolve(Path::new("/srv"), "../etc/passwd").is_err());
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(resolve(Path::new("/srv"), "/etc/passwd").is_err());
    }

    #[test]
    fn rejects_nested_paths() {
        assert!(resolve(Path::new("/srv"), "a/b").is_err());
    }

    #[test]
    fn strips_a_leading_current_dir_segment() {
        assert_eq!(
            resolve(Path::new("/srv"), "./report.txt").unwrap(),
            PathBuf::from("/srv/report.txt")
        );
    }

    #[test]
    fn rejects_an_empty_argument() {
        assert!(resolve(Path::new("/srv"), "").is_err());
    }
}
