/// Git metadata captured by the build script.
///
/// Every field is optional because the crate may be built outside a git
/// checkout, in which case vergen emits nothing.
pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub branch: Option<&'static str>,
    pub describe: Option<&'static str>,
    pub git_dirty: bool,
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    branch: option_env!("VERGEN_GIT_BRANCH"),
    describe: option_env!("VERGEN_GIT_DESCRIBE"),
    git_dirty: is_true(option_env!("VERGEN_GIT_DIRTY")),
};

const fn is_true(value: Option<&str>) -> bool {
    match value {
        Some(v) => matches!(v.as_bytes(), b"true"),
        None => false,
    }
}
