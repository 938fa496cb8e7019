use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use anyhow::{anyhow, bail};

/// The 64-bit identity of a switch ('datapath'), treated as 8 opaque bytes. All-zero is used
///  as 'not known yet'.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DatapathId([u8; 8]);

impl DatapathId {
    pub const EMPTY: DatapathId = DatapathId([0; 8]);

    pub fn new(bytes: [u8; 8]) -> DatapathId {
        DatapathId(bytes)
    }

    pub fn from_u64(value: u64) -> DatapathId {
        DatapathId(value.to_be_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; 8]
    }
}

impl Display for DatapathId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for DatapathId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for DatapathId {
    type Err = anyhow::Error;

    /// Parses the colon-separated form `00:00:00:00:00:00:00:01`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 8];
        let mut parts = s.split(':');
        for b in bytes.iter_mut() {
            let part = parts.next()
                .ok_or_else(|| anyhow!("datapath id {:?} has less than 8 bytes", s))?;
            if part.len() != 2 {
                bail!("invalid byte {:?} in datapath id {:?}", part, s);
            }
            *b = u8::from_str_radix(part, 16)?;
        }
        if parts.next().is_some() {
            bail!("datapath id {:?} has more than 8 bytes", s);
        }
        Ok(DatapathId(bytes))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_display() {
        let dpid = DatapathId::from_u64(0x0000_0000_0000_00ab);
        assert_eq!(dpid.to_string(), "00:00:00:00:00:00:00:ab");
        assert_eq!(dpid.as_u64(), 0xab);
        assert!(!dpid.is_empty());
        assert!(DatapathId::EMPTY.is_empty());
    }

    #[test]
    fn test_parse() {
        let dpid: DatapathId = "01:02:03:04:05:06:07:08".parse().unwrap();
        assert_eq!(dpid.bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[rstest]
    #[case::too_short("01:02:03")]
    #[case::too_long("01:02:03:04:05:06:07:08:09")]
    #[case::not_hex("01:02:03:04:05:06:07:zz")]
    #[case::wide("001:02:03:04:05:06:07:08")]
    fn test_parse_invalid(#[case] s: &str) {
        assert!(s.parse::<DatapathId>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(DatapathId::from_u64(1) < DatapathId::from_u64(2));
        assert!(DatapathId::from_u64(0x100) > DatapathId::from_u64(0xff));
    }
}
