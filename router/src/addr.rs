use std::fmt;
use std::str::FromStr;

/// A forest address.
///
/// Positive values are unicast and split into a 16-bit zip code (upper half)
/// and a 16-bit local address (lower half), both non-zero for a valid
/// unicast address. Negative values identify multicast groups. Zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FAdr(i32);

impl FAdr {
    pub const NULL: FAdr = FAdr(0);

    pub fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Builds a unicast address from a zip code and a local address.
    pub fn unicast(zip: u16, local: u16) -> Self {
        Self(((zip as i32) << 16) | local as i32)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True for a well-formed unicast address: positive with non-zero zip
    /// code and non-zero local part.
    pub fn is_unicast(self) -> bool {
        self.0 > 0 && self.zip() != 0 && self.local() != 0
    }

    pub fn is_multicast(self) -> bool {
        self.0 < 0
    }

    pub fn zip(self) -> u16 {
        ((self.0 >> 16) & 0x7fff) as u16
    }

    pub fn local(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// The zip-aggregated form of this address, i.e. `zip.0`.
    ///
    /// Routes to destinations outside the router's own zip code are stored
    /// under this form.
    pub fn zip_prefix(self) -> Self {
        Self(self.0 & !0xffff)
    }
}

impl fmt::Display for FAdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            self.0.fmt(f)
        } else {
            write!(f, "{}.{}", self.zip(), self.local())
        }
    }
}

/// Failed to parse a forest address from its text form.
#[derive(Debug, thiserror::Error)]
#[error("invalid forest address `{0}`")]
pub struct InvalidFAdr(String);

impl FromStr for FAdr {
    type Err = InvalidFAdr;

    /// Parses `zip.local` as unicast or a negative decimal as multicast.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidFAdr(s.to_owned());

        if let Some((zip, local)) = s.split_once('.') {
            let zip = zip.parse::<u16>().map_err(|_| invalid())?;
            let local = local.parse::<u16>().map_err(|_| invalid())?;

            return Ok(FAdr::unicast(zip, local));
        }

        let raw = s.parse::<i32>().map_err(|_| invalid())?;
        if raw >= 0 {
            return Err(invalid());
        }

        Ok(FAdr(raw))
    }
}
