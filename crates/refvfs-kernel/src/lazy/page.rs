//! Page rows and their postcard encoding.

use serde::{Deserialize, Serialize};

use crate::entry::{ByteRange, ReferenceEntry};
use crate::error::{RefError, RefResult};

/// One persisted row.
///
/// - `path: None`, `raw: Some` → literal bytes
/// - `path: Some`, `size > 0` → range `[offset, offset + size)` of `path`
/// - `path: Some`, `size == 0` → whole target
/// - `path: None`, `raw: None` → no reference at this row
///
/// A zero-length range has no bytes to fetch, so it is stored as an
/// empty literal rather than colliding with the whole-target form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRow {
    pub path: Option<String>,
    pub offset: u64,
    pub size: u64,
    pub raw: Option<Vec<u8>>,
}

impl PageRow {
    /// Row for an entry. Encoded and structured entries are stored as
    /// their materialized bytes.
    pub fn from_entry(key: &str, entry: Option<&ReferenceEntry>) -> RefResult<Self> {
        let Some(entry) = entry else {
            return Ok(Self::default());
        };
        Ok(match entry {
            ReferenceEntry::Remote {
                range: Some(ByteRange { length: 0, .. }),
                ..
            } => Self {
                raw: Some(Vec::new()),
                ..Self::default()
            },
            ReferenceEntry::Remote { locator, range } => {
                let ByteRange { offset, length } = range.unwrap_or(ByteRange::new(0, 0));
                Self {
                    path: Some(locator.clone()),
                    offset,
                    size: length,
                    raw: None,
                }
            }
            inline => Self {
                raw: inline.inline_bytes(key)?,
                ..Self::default()
            },
        })
    }

    pub fn into_entry(self) -> Option<ReferenceEntry> {
        match (self.path, self.raw) {
            (Some(locator), _) if self.size == 0 => Some(ReferenceEntry::whole(locator)),
            (Some(locator), _) => Some(ReferenceEntry::range(locator, self.offset, self.size)),
            (None, Some(raw)) => Some(ReferenceEntry::Literal(raw)),
            (None, None) => None,
        }
    }
}

/// Decoded page: one slot per row, `None` where no reference exists.
pub type PageSlots = Vec<Option<ReferenceEntry>>;

pub fn encode(key: &str, slots: &[Option<ReferenceEntry>]) -> RefResult<Vec<u8>> {
    let rows = slots
        .iter()
        .map(|slot| PageRow::from_entry(key, slot.as_ref()))
        .collect::<RefResult<Vec<_>>>()?;
    postcard::to_stdvec(&rows).map_err(|e| RefError::decode(key, e))
}

pub fn decode(key: &str, bytes: &[u8]) -> RefResult<PageSlots> {
    let rows: Vec<PageRow> = postcard::from_bytes(bytes).map_err(|e| RefError::decode(key, e))?;
    Ok(rows.into_iter().map(PageRow::into_entry).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_kinds() {
        let slots = vec![
            Some(ReferenceEntry::range("s3://b/k", 10, 20)),
            None,
            Some(ReferenceEntry::whole("s3://b/whole")),
            Some(ReferenceEntry::literal(vec![1, 2, 3])),
            Some(ReferenceEntry::Structured(json!({"a": 1}))),
        ];
        let bytes = encode("page", &slots).unwrap();
        let back = decode("page", &bytes).unwrap();

        assert_eq!(back[0], Some(ReferenceEntry::range("s3://b/k", 10, 20)));
        assert_eq!(back[1], None);
        assert_eq!(back[2], Some(ReferenceEntry::whole("s3://b/whole")));
        assert_eq!(back[3], Some(ReferenceEntry::literal(vec![1, 2, 3])));
        assert_eq!(back[4], Some(ReferenceEntry::literal(br#"{"a":1}"#.to_vec())));
    }

    #[test]
    fn test_zero_length_range_stays_empty() {
        let slots = vec![Some(ReferenceEntry::range("s3://b/k", 7, 0))];
        let back = decode("page", &encode("page", &slots).unwrap()).unwrap();
        assert_eq!(back[0], Some(ReferenceEntry::literal(Vec::<u8>::new())));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = decode("p", &[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, RefError::Decode { .. }));
    }
}
