//! Flattened rootfs export
//!
//! Squashes an image's layer stack into a single tarball. Layers are
//! walked top to bottom; a name map records which paths are already
//! handled so upper layers shadow lower ones, whiteout entries tombstone
//! their targets, and nothing under a tombstoned path is emitted. The
//! output never contains a whiteout entry.

use crate::registry::client::{RegistryClient, RegistryError, ResolvedImage};
use log::{debug, trace};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::EntryType;

/// Basename prefix marking a deleted lower-layer path
const WHITEOUT_PREFIX: &str = ".wh.";

/// Basename hiding everything a directory contained in lower layers
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Stream the flattened filesystem of `image` into `out` as a tar.
pub fn export_flattened<W: Write>(
    client: &RegistryClient,
    image: &ResolvedImage,
    out: W,
) -> Result<(), RegistryError> {
    let mut flattener = Flattener::new(out);

    for (i, layer) in image.manifest.layers.iter().enumerate().rev() {
        debug!("flattening layer {} ({})", i, layer.digest);
        let data = client.fetch_layer(image, layer)?;
        flattener.add_layer(&data)?;
    }

    flattener.finish()?;
    Ok(())
}

/// Folds layers fed top-down into one output tar.
struct Flattener<W: Write> {
    builder: tar::Builder<W>,
    /// path -> shadows-children flag; whiteouts and non-directories block
    /// any lower entry with the same name or below it
    file_map: HashMap<PathBuf, bool>,
}

impl<W: Write> Flattener<W> {
    fn new(out: W) -> Self {
        Self {
            builder: tar::Builder::new(out),
            file_map: HashMap::new(),
        }
    }

    /// Fold in the next layer down the stack.
    fn add_layer(&mut self, data: &[u8]) -> Result<(), RegistryError> {
        let mut archive = tar::Archive::new(data);

        // opaque markers tombstone their own directory, but only take
        // effect once this layer is done: the marking layer's files
        // under the directory still surface, only lower layers' do not
        let mut opaque_dirs: Vec<PathBuf> = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path: PathBuf = entry.path()?.into_owned();
            let kind = entry.header().entry_type();

            let basename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            if basename == OPAQUE_WHITEOUT {
                let dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
                trace!("opaque whiteout over {}", dir.display());
                opaque_dirs.push(dir);
                continue;
            }

            let tombstone = basename.starts_with(WHITEOUT_PREFIX);
            let name = if tombstone {
                path.parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join(&basename[WHITEOUT_PREFIX.len()..])
            } else {
                path.clone()
            };

            if self.file_map.contains_key(&name) {
                continue;
            }
            if in_whiteout_dir(&self.file_map, &name) {
                continue;
            }
            self.file_map
                .insert(name, tombstone || kind != EntryType::Directory);

            if tombstone {
                trace!("whiteout {}", path.display());
                continue;
            }

            let mut header = entry.header().clone();
            match kind {
                EntryType::Link | EntryType::Symlink => {
                    let target = entry
                        .link_name()?
                        .map(|t| t.into_owned())
                        .unwrap_or_default();
                    self.builder.append_link(&mut header, &path, &target)?;
                }
                _ => {
                    self.builder.append_data(&mut header, &path, &mut entry)?;
                }
            }
        }

        for dir in opaque_dirs {
            self.file_map.insert(dir, true);
        }

        Ok(())
    }

    /// Terminate the archive and hand back the writer.
    fn finish(self) -> Result<W, RegistryError> {
        Ok(self.builder.into_inner()?)
    }
}

fn in_whiteout_dir(file_map: &HashMap<PathBuf, bool>, name: &Path) -> bool {
    name.ancestors()
        .skip(1)
        .any(|parent| file_map.get(parent) == Some(&true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tar::Header;

    fn dir_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
    }

    fn file_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, content: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        builder.append_data(&mut header, path, content).unwrap();
    }

    fn layer(build: impl FnOnce(&mut tar::Builder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder);
        builder.into_inner().unwrap()
    }

    /// Run layers (top first) through a Flattener and list the output.
    fn flatten(layers: &[Vec<u8>]) -> Vec<(String, Vec<u8>)> {
        let mut flattener = Flattener::new(Vec::new());
        for layer in layers {
            flattener.add_layer(layer).unwrap();
        }
        let out = flattener.finish().unwrap();

        let mut archive = tar::Archive::new(&out[..]);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let mut content = Vec::new();
                e.read_to_end(&mut content).unwrap();
                (name, content)
            })
            .collect()
    }

    fn names(entries: &[(String, Vec<u8>)]) -> Vec<&str> {
        entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn opaque_whiteout_hides_lower_contents_but_not_its_own_layer() {
        // upper layer replaces data/ wholesale
        let upper = layer(|b| {
            dir_entry(b, "data");
            file_entry(b, "data/.wh..wh..opq", b"");
            file_entry(b, "data/newfile", b"new");
        });
        let lower = layer(|b| {
            dir_entry(b, "data");
            file_entry(b, "data/oldfile", b"old");
            file_entry(b, "other", b"o");
        });

        let out = flatten(&[upper, lower]);
        let out_names = names(&out);

        assert!(out_names.contains(&"data"));
        assert!(out_names.contains(&"data/newfile"));
        assert!(out_names.contains(&"other"));
        assert!(!out_names.contains(&"data/oldfile"));
        assert!(
            out_names.iter().all(|n| !n.contains(".wh.")),
            "no whiteout entries may survive: {:?}",
            out_names
        );
    }

    #[test]
    fn opaque_whiteout_without_its_own_dir_entry_still_blocks() {
        let upper = layer(|b| {
            file_entry(b, "cache/.wh..wh..opq", b"");
        });
        let lower = layer(|b| {
            dir_entry(b, "cache");
            file_entry(b, "cache/stale", b"s");
            file_entry(b, "kept", b"k");
        });

        let out = flatten(&[upper, lower]);
        let out_names = names(&out);

        assert!(!out_names.contains(&"cache/stale"));
        assert!(out_names.contains(&"kept"));
    }

    #[test]
    fn plain_whiteout_tombstones_the_named_lower_file() {
        let upper = layer(|b| {
            file_entry(b, ".wh.stale", b"");
        });
        let lower = layer(|b| {
            file_entry(b, "stale", b"old");
            file_entry(b, "kept", b"k");
        });

        let out = flatten(&[upper, lower]);
        let out_names = names(&out);

        assert_eq!(out_names, vec!["kept"]);
    }

    #[test]
    fn upper_files_shadow_lower_files_of_the_same_name() {
        let upper = layer(|b| {
            file_entry(b, "etc/conf", b"new");
        });
        let lower = layer(|b| {
            file_entry(b, "etc/conf", b"old");
        });

        let out = flatten(&[upper, lower]);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0], ("etc/conf".to_string(), b"new".to_vec()));
    }

    fn map(entries: &[(&str, bool)]) -> HashMap<PathBuf, bool> {
        entries
            .iter()
            .map(|(p, t)| (PathBuf::from(p), *t))
            .collect()
    }

    #[test]
    fn whiteout_dir_blocks_children() {
        let m = map(&[("usr/share", true)]);
        assert!(in_whiteout_dir(&m, Path::new("usr/share/doc/README")));
        assert!(!in_whiteout_dir(&m, Path::new("usr/bin/ls")));
    }

    #[test]
    fn plain_directories_do_not_block_children() {
        let m = map(&[("usr", false)]);
        assert!(!in_whiteout_dir(&m, Path::new("usr/bin/ls")));
    }

    #[test]
    fn exact_name_is_not_its_own_ancestor() {
        let m = map(&[("etc/passwd", true)]);
        assert!(!in_whiteout_dir(&m, Path::new("etc/passwd")));
        assert!(in_whiteout_dir(&m, Path::new("etc/passwd/impossible")));
    }
}
