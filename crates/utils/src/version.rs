use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1.unwrap_or("unknown"),
        if BUILD_INFO.git_dirty { "-dirty" } else { "" }
    )
});

/// Version string advertised as the node's kubelet version.
///
/// Prefers `git describe` output and falls back to the image version.
pub static KUBELET_VERSION: LazyLock<String> = LazyLock::new(|| {
    let base = BUILD_INFO.describe.unwrap_or(env!("IMAGE_VERSION"));
    match BUILD_INFO.branch {
        Some(branch) if branch != "main" && branch != "master" => format!("{base}+{branch}"),
        _ => base.to_string(),
    }
});
