use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key material that is wiped when dropped.
///
/// Deliberately not `Clone`: copies must be made explicitly with
/// [`SecretBytes::duplicate`] so every live copy is visible at the call site.
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn duplicate(&self) -> Self {
        Self(self.0.clone())
    }
}

impl AsRef<[u8]> for SecretBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_does_not_leak_contents() {
        let secret = SecretBytes::new(vec![0x41; 4]);
        assert_eq!(format!("{secret:?}"), "SecretBytes(4 bytes)");
    }

    #[test]
    fn duplicate_is_independent() {
        let a = SecretBytes::from_slice(&[1, 2, 3]);
        let mut b = a.duplicate();
        b.zeroize();
        assert_eq!(a.as_bytes(), &[1, 2, 3]);
        assert!(b.is_empty());
    }
}
