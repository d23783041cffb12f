//! Extended-attribute noise filtering.
//!
//! SELinux labels every file it sees, so a tree restored through a mount
//! picks up `security.selinux` entries the source never had. They are
//! dropped from both sides before comparison.

use std::collections::BTreeMap;

/// Key of the security label stripped before comparison.
pub const SECURITY_LABEL_KEY: &[u8] = b"security.selinux";

/// Collections of extended attributes that can drop the security label.
///
/// Implementations keep their collection type and the order of every
/// remaining entry.
pub trait StripSecurityLabel: Sized {
    /// Return the collection without [`SECURITY_LABEL_KEY`].
    #[must_use]
    fn without_security_label(self) -> Self;
}

impl StripSecurityLabel for BTreeMap<Vec<u8>, Vec<u8>> {
    fn without_security_label(mut self) -> Self {
        self.remove(SECURITY_LABEL_KEY);
        self
    }
}

impl StripSecurityLabel for Vec<Vec<u8>> {
    fn without_security_label(mut self) -> Self {
        self.retain(|key| key.as_slice() != SECURITY_LABEL_KEY);
        self
    }
}

impl StripSecurityLabel for Vec<(Vec<u8>, Vec<u8>)> {
    fn without_security_label(mut self) -> Self {
        self.retain(|(key, _)| key.as_slice() != SECURITY_LABEL_KEY);
        self
    }
}

/// Free-function form of [`StripSecurityLabel::without_security_label`].
pub fn no_selinux<T: StripSecurityLabel>(attrs: T) -> T {
    attrs.without_security_label()
}
