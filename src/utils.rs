use std::path::{Path, PathBuf};

/// Insert `suffix` into a file name just before its extension, keeping the
/// parent directory. Compound NIfTI extensions are handled as a unit, so
/// `dmri.nii.gz` + `_moco` gives `dmri_moco.nii.gz`.
pub fn add_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let (stem, ext) = split_name(name);
    let new_name = format!("{}{}{}", stem, suffix, ext);
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(new_name),
        _ => PathBuf::from(new_name),
    }
}

/// Split a file name into (stem, extension), where the extension keeps its
/// leading dot and `.nii.gz` counts as a single extension.
fn split_name(name: &str) -> (&str, &str) {
    if let Some(stem) = name.strip_suffix(".nii.gz") {
        return (stem, ".nii.gz");
    }
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod utils_tests {
    use super::*;

    #[test]
    fn test_add_suffix_compound_extension() {
        let out = add_suffix(Path::new("sub/dmri.nii.gz"), "_moco");
        assert_eq!(out, PathBuf::from("sub/dmri_moco.nii.gz"));
    }

    #[test]
    fn test_add_suffix_simple_extension() {
        let out = add_suffix(Path::new("target.nii"), "_mean");
        assert_eq!(out, PathBuf::from("target_mean.nii"));
    }

    #[test]
    fn test_add_suffix_no_extension() {
        let out = add_suffix(Path::new("volume"), "_moco");
        assert_eq!(out, PathBuf::from("volume_moco"));
    }
}
