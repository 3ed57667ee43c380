//! Formatting helpers shared across the kernel crates.

use core::fmt;

/// Wrapper for human-readable byte sizes
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(u64);

const SIZE_UNITS: &[(u64, &str)] = &[
    (1024 * 1024 * 1024, "GiB"),
    (1024 * 1024, "MiB"),
    (1024, "KiB"),
];

impl ByteSize {
    pub const fn new(bytes: u64) -> ByteSize {
        ByteSize(bytes)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "0 bytes");
        }

        let mut remaining = self.0;
        let mut needs_spacing = false;
        for (size, suffix) in SIZE_UNITS {
            let amount = remaining / size;
            remaining %= size;

            if amount > 0 {
                if needs_spacing {
                    write!(f, " ")?;
                }
                write!(f, "{} {}", amount, suffix)?;
                needs_spacing = true;
            }
        }

        if remaining > 0 {
            if needs_spacing {
                write!(f, " ")?;
            }
            write!(f, "{} bytes", remaining)?;
        }
        Ok(())
    }
}

pub trait ByteSizeExt {
    fn as_size(&self) -> ByteSize;
}

impl ByteSizeExt for u64 {
    #[inline(always)]
    fn as_size(&self) -> ByteSize {
        ByteSize(*self)
    }
}

impl ByteSizeExt for usize {
    #[inline(always)]
    fn as_size(&self) -> ByteSize {
        ByteSize(*self as u64)
    }
}

#[cfg(test)]
mod test {
    use super::ByteSizeExt;

    #[test]
    fn test_byte_size_display() {
        assert_eq!(format!("{}", 0u64.as_size()), "0 bytes");
        assert_eq!(format!("{}", 100u64.as_size()), "100 bytes");
        assert_eq!(format!("{}", 4096u64.as_size()), "4 KiB");
        assert_eq!(format!("{}", 4100u64.as_size()), "4 KiB 4 bytes");
        assert_eq!(format!("{}", (16 * 1024 * 1024u64).as_size()), "16 MiB");
        assert_eq!(
            format!("{}", (3 * 1024 * 1024 * 1024 + 512 * 1024u64).as_size()),
            "3 GiB 512 KiB"
        );
    }
}
