//! Addresses of application entities in DICOM networks.
//!
//! This module provides [`AeAddr`],
//! which couples a network address with an optional
//! application entity (AE) title,
//! its counterpart [`FullAeAddr`] with a mandatory one,
//! plus [`validate_ae_title`] for checking AE titles
//! before they are put on the wire.
//!
//! The syntax is `«ae_title»@«network_address»:«port»`,
//! where the AE title and the `@` separator may be omitted.
//! IPv4 and IPv6 addresses work as well as domain names.
use std::{fmt, str::FromStr};

use snafu::{ensure, AsErrorSource, OptionExt, ResultExt, Snafu};

/// The maximum length of an AE title, in bytes.
pub const MAX_AE_TITLE_LENGTH: usize = 16;

/// An error in an application entity title.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum AeTitleError {
    /// AE title is empty or only has spaces
    Empty,
    #[snafu(display("AE title `{}` is longer than 16 characters", ae_title))]
    TooLong { ae_title: String },
    #[snafu(display("AE title `{}` has a forbidden character", ae_title))]
    ForbiddenCharacter { ae_title: String },
}

/// Check that the given text is a valid AE title:
/// between 1 and 16 characters of the default repertoire,
/// with no backslash nor control characters,
/// and not only spaces.
///
/// Leading and trailing spaces are not significant.
///
/// ```
/// # use dicom_ulp::address::validate_ae_title;
/// assert!(validate_ae_title("STORE-SCP").is_ok());
/// assert!(validate_ae_title("   ").is_err());
/// assert!(validate_ae_title("A-VERY-LONG-AE-TITLE").is_err());
/// ```
pub fn validate_ae_title(ae_title: &str) -> Result<(), AeTitleError> {
    let trimmed = ae_title.trim_matches(' ');
    ensure!(!trimmed.is_empty(), EmptySnafu);
    ensure!(
        ae_title.len() <= MAX_AE_TITLE_LENGTH,
        TooLongSnafu { ae_title }
    );
    ensure!(
        ae_title
            .chars()
            .all(|c| c.is_ascii() && !c.is_ascii_control() && c != '\\'),
        ForbiddenCharacterSnafu { ae_title }
    );
    Ok(())
}

/// An error which may occur when parsing an AE address.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ParseAeAddressError<E>
where
    E: std::fmt::Debug + AsErrorSource,
{
    /// Missing network address
    MissingAddress,

    /// Missing `@` in full AE address
    MissingAeTitle,

    /// Invalid AE title
    InvalidAeTitle { source: AeTitleError },

    /// Could not parse network address
    ParseAddress { source: E },
}

/// A specification for an address to the target SCP:
/// a network address, plus an optional application entity title.
///
/// These addresses can be serialized and parsed
/// with the syntax `{ae_title}@{address}`,
/// where the network address is parsed according to
/// the expectations of the parameter type `T`
/// (typically `String` or [`SocketAddr`](std::net::SocketAddr)).
///
/// # Example
///
/// ```
/// # use dicom_ulp::AeAddr;
/// # use std::net::SocketAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: AeAddr<String> = "ECHO-SCP@127.0.0.1:11112".parse()?;
/// assert_eq!(addr.ae_title(), Some("ECHO-SCP"));
/// assert_eq!(addr.socket_addr(), "127.0.0.1:11112");
///
/// let addr: AeAddr<SocketAddr> = "[::1]:104".parse()?;
/// assert_eq!(addr.ae_title(), None);
/// assert_eq!(addr.to_string(), "[::1]:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AeAddr<T> {
    ae_title: Option<String>,
    socket_addr: T,
}

impl<T> AeAddr<T> {
    /// Create an AE address from its bare constituent parts.
    ///
    /// The AE title is not validated.
    pub fn new(ae_title: Option<String>, socket_addr: T) -> Self {
        AeAddr {
            ae_title,
            socket_addr,
        }
    }

    /// Create an address with no AE title.
    pub fn new_socket_addr(socket_addr: T) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }

    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    pub fn socket_addr(&self) -> &T {
        &self.socket_addr
    }

    /// Use the given AE title unless the address already has one.
    pub fn with_default_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        if self.ae_title.is_none() {
            self.ae_title = Some(ae_title.into());
        }
        self
    }

    pub fn into_parts(self) -> (Option<String>, T) {
        (self.ae_title, self.socket_addr)
    }
}

impl<T> FromStr for AeAddr<T>
where
    T: FromStr,
    T::Err: std::fmt::Debug + AsErrorSource,
{
    type Err = ParseAeAddressError<T::Err>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // AE titles may contain `@`, network addresses may not
        let (ae_title, address) = match s.rsplit_once('@') {
            Some((ae_title, address)) => {
                validate_ae_title(ae_title).context(InvalidAeTitleSnafu)?;
                (Some(ae_title.to_string()), address)
            }
            None => (None, s),
        };
        ensure!(!address.is_empty(), MissingAddressSnafu);
        let socket_addr = address.parse().context(ParseAddressSnafu)?;
        Ok(AeAddr {
            ae_title,
            socket_addr,
        })
    }
}

impl<T> fmt::Display for AeAddr<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ae_title) = &self.ae_title {
            write!(f, "{}@", ae_title)?;
        }
        self.socket_addr.fmt(f)
    }
}

/// An address to a node with a mandatory AE title,
/// written `{ae_title}@{address}`.
///
/// ```
/// # use dicom_ulp::FullAeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr<String> = "STORE-SCP@10.0.0.100:104".parse()?;
/// assert_eq!(addr.ae_title(), "STORE-SCP");
/// assert!("10.0.0.100:104".parse::<FullAeAddr<String>>().is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullAeAddr<T> {
    ae_title: String,
    socket_addr: T,
}

impl<T> FullAeAddr<T> {
    pub fn new(ae_title: impl Into<String>, socket_addr: T) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            socket_addr,
        }
    }

    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    pub fn socket_addr(&self) -> &T {
        &self.socket_addr
    }

    pub fn into_parts(self) -> (String, T) {
        (self.ae_title, self.socket_addr)
    }
}

impl<T> From<FullAeAddr<T>> for AeAddr<T> {
    fn from(full: FullAeAddr<T>) -> Self {
        AeAddr::new(Some(full.ae_title), full.socket_addr)
    }
}

impl<T> FromStr for FullAeAddr<T>
where
    T: FromStr,
    T::Err: std::fmt::Debug + AsErrorSource,
{
    type Err = ParseAeAddressError<T::Err>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, socket_addr) = s.parse::<AeAddr<T>>()?.into_parts();
        let ae_title = ae_title.context(MissingAeTitleSnafu)?;
        Ok(FullAeAddr {
            ae_title,
            socket_addr,
        })
    }
}

impl<T> fmt::Display for FullAeAddr<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.socket_addr)
    }
}
