//! Object names: a 32-bit pattern or a bounded string, depending on the
//! naming mode of the object class.

use alloc::string::String;

/// Naming mode of an object class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMode {
    /// Four-character names packed into a `u32`.
    U32,
    /// Heap strings truncated to `max_len` bytes.
    String { max_len: usize },
}

/// Name of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectName {
    U32(u32),
    String(Option<String>),
}

/// Packs four characters into a 32-bit name, first character in the most
/// significant byte.
pub const fn build_name(c1: u8, c2: u8, c3: u8, c4: u8) -> u32 {
    (c1 as u32) << 24 | (c2 as u32) << 16 | (c3 as u32) << 8 | c4 as u32
}

impl ObjectName {
    /// The empty name of a naming mode.
    pub const fn empty(mode: NameMode) -> Self {
        match mode {
            NameMode::U32 => ObjectName::U32(0),
            NameMode::String { .. } => ObjectName::String(None),
        }
    }

    pub fn from_text(text: &str) -> Self {
        ObjectName::String(Some(String::from(text)))
    }

    /// The null name can never be looked up.
    pub fn is_empty(&self) -> bool {
        match self {
            ObjectName::U32(value) => *value == 0,
            ObjectName::String(None) => true,
            ObjectName::String(Some(text)) => text.is_empty(),
        }
    }

    pub fn matches_mode(&self, mode: NameMode) -> bool {
        matches!(
            (self, mode),
            (ObjectName::U32(_), NameMode::U32)
                | (ObjectName::String(_), NameMode::String { .. })
        )
    }

    /// Truncates string names to `max_len` bytes, on a character boundary.
    pub fn truncated(self, mode: NameMode) -> Self {
        match (self, mode) {
            (ObjectName::String(Some(mut text)), NameMode::String { max_len }) => {
                if text.len() > max_len {
                    let mut end = max_len;
                    while !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    text.truncate(end);
                }
                ObjectName::String(Some(text))
            }
            (name, _) => name,
        }
    }

    /// Renders the name as text into `buffer`, returning the used part.
    ///
    /// 32-bit names yield up to four characters: NUL bytes are skipped and
    /// non-printable characters are replaced by `*`.
    pub fn to_text<'a>(&self, buffer: &'a mut [u8]) -> &'a str {
        let mut len = 0;
        match self {
            ObjectName::U32(value) => {
                for byte in value.to_be_bytes() {
                    if byte == 0 {
                        continue;
                    }
                    if len == buffer.len() {
                        break;
                    }
                    buffer[len] = if byte.is_ascii_graphic() || byte == b' ' {
                        byte
                    } else {
                        b'*'
                    };
                    len += 1;
                }
            }
            ObjectName::String(Some(text)) => {
                let mut end = text.len().min(buffer.len());
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                buffer[..end].copy_from_slice(&text.as_bytes()[..end]);
                len = end;
            }
            ObjectName::String(None) => {}
        }
        // Only ASCII or whole UTF-8 characters were copied.
        core::str::from_utf8(&buffer[..len]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_name() {
        assert_eq!(build_name(b'T', b'A', b'S', b'K'), 0x5441_534B);
    }

    #[test]
    fn test_u32_name_to_text() {
        let mut buffer = [0u8; 8];
        let name = ObjectName::U32(build_name(b'I', b'D', b'L', b'E'));
        assert_eq!(name.to_text(&mut buffer), "IDLE");

        let name = ObjectName::U32(build_name(b'A', 0, 0x07, b'B'));
        assert_eq!(name.to_text(&mut buffer), "A*B");
    }

    #[test]
    fn test_string_name_truncation() {
        let mode = NameMode::String { max_len: 4 };
        let name = ObjectName::from_text("worker").truncated(mode);
        assert_eq!(name, ObjectName::from_text("work"));

        let mut buffer = [0u8; 2];
        assert_eq!(name.to_text(&mut buffer), "wo");
    }

    #[test]
    fn test_empty_names() {
        assert!(ObjectName::empty(NameMode::U32).is_empty());
        assert!(ObjectName::empty(NameMode::String { max_len: 8 }).is_empty());
        assert!(ObjectName::from_text("").is_empty());
        assert!(!ObjectName::U32(1).is_empty());
        assert!(ObjectName::U32(1).matches_mode(NameMode::U32));
        assert!(!ObjectName::U32(1).matches_mode(NameMode::String { max_len: 1 }));
    }
}
