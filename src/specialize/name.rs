use std::ffi::CString;

use crate::{error::prelude::*, logging};

const MAX_NAME_LENGTH: usize = 15;

/// The part of `name` the kernel will keep as the thread name.
///
/// Dotted identifiers keep their tail (`com.example.app.service` becomes
/// `ple.app.service`), everything else keeps its head.
pub fn truncated_name(name: &str) -> &str {
    let mut name = name;
    if name.len() >= MAX_NAME_LENGTH && !name.contains('@') && name.contains('.') {
        let mut start = name.len() - MAX_NAME_LENGTH;
        while !name.is_char_boundary(start) {
            start += 1;
        }
        name = &name[start..];
    }
    let mut end = name.len().min(MAX_NAME_LENGTH);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Renames the calling thread and retags the log.
pub fn set_thread_name(name: &str) -> Result {
    let short = truncated_name(name);
    logging::set_tag(name);
    let c_name = CString::new(short).context("Thread name contains a NUL byte")?;
    nix::sys::prctl::set_name(&c_name).context("Couldn't set thread name")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_names_keep_their_tail() {
        assert_eq!(truncated_name("com.example.myapplication.service"), "ication.service");
        assert_eq!(truncated_name("com.example.myapplication.service").len(), 15);
    }

    #[test]
    fn short_or_undotted_names_keep_their_head() {
        assert_eq!(truncated_name("supervisor"), "supervisor");
        assert_eq!(truncated_name("a_very_long_name_without_dots"), "a_very_long_nam");
        assert_eq!(truncated_name("user@com.example.myapplication"), "user@com.exampl");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let name = "com.example.ünïcödé.app";
        let short = truncated_name(name);
        assert!(short.len() <= 15);
        assert!(name.ends_with(short));
    }
}
