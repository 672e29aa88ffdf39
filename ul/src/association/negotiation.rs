//! Presentation context negotiation.
//!
//! The acceptor decides the outcome of each proposed presentation context
//! by matching it against its table of [supported syntaxes](SupportedSyntaxes).
//! [`negotiate`] is a pure function:
//! the same proposal against the same table always yields the same result.
use crate::pdu::{PresentationContextProposed, PresentationContextResult, PresentationContextResultReason};
use crate::uids::trim_uid;

/// Which side's order of preference decides
/// when several proposed transfer syntaxes are supported.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransferSyntaxPriority {
    /// accept the first supported transfer syntax in proposal order
    #[default]
    Requestor,
    /// accept the supported transfer syntax
    /// which comes first in the acceptor's own list
    Acceptor,
}

/// The abstract syntaxes supported by an acceptor,
/// each with its transfer syntaxes in order of preference.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SupportedSyntaxes {
    entries: Vec<(String, Vec<String>)>,
    /// transfer syntaxes for abstract syntaxes not in the table,
    /// when accepting any abstract syntax
    promiscuous: Option<Vec<String>>,
}

impl SupportedSyntaxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Support an abstract syntax with the given transfer syntaxes.
    ///
    /// Adding an abstract syntax a second time
    /// appends the transfer syntaxes not yet listed for it.
    pub fn with<A, I, T>(mut self, abstract_syntax: A, transfer_syntaxes: I) -> Self
    where
        A: AsRef<str>,
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.add(abstract_syntax, transfer_syntaxes);
        self
    }

    pub fn add<A, I, T>(&mut self, abstract_syntax: A, transfer_syntaxes: I)
    where
        A: AsRef<str>,
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let abstract_syntax = trim_uid(abstract_syntax.as_ref());
        let index = match self
            .entries
            .iter()
            .position(|(uid, _)| uid == abstract_syntax)
        {
            Some(index) => index,
            None => {
                self.entries.push((abstract_syntax.to_string(), Vec::new()));
                self.entries.len() - 1
            }
        };
        let list = &mut self.entries[index].1;
        for ts in transfer_syntaxes {
            let ts = trim_uid(ts.as_ref());
            if !list.iter().any(|t| t == ts) {
                list.push(ts.to_string());
            }
        }
    }

    /// Accept abstract syntaxes outside of the table,
    /// with the given transfer syntaxes.
    pub fn promiscuous<I, T>(mut self, transfer_syntaxes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.promiscuous = Some(
            transfer_syntaxes
                .into_iter()
                .map(|ts| trim_uid(ts.as_ref()).to_string())
                .collect(),
        );
        self
    }

    pub fn is_promiscuous(&self) -> bool {
        self.promiscuous.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.promiscuous.is_none()
    }

    /// The transfer syntaxes supported for the given abstract syntax,
    /// or `None` if the abstract syntax is not supported.
    pub fn transfer_syntaxes_for(&self, abstract_syntax: &str) -> Option<&[String]> {
        let abstract_syntax = trim_uid(abstract_syntax);
        self.entries
            .iter()
            .find(|(uid, _)| uid == abstract_syntax)
            .map(|(_, ts)| ts.as_slice())
            .or(self.promiscuous.as_deref())
    }

    pub fn abstract_syntaxes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(uid, _)| uid.as_str())
    }
}

/// The outcome of negotiating one presentation context.
///
/// An accepted context has exactly one transfer syntax,
/// and a rejected context has none.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresentationContextNegotiated {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: Option<String>,
    pub reason: PresentationContextResultReason,
}

impl PresentationContextNegotiated {
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }

    fn rejected(
        proposed: &PresentationContextProposed,
        reason: PresentationContextResultReason,
    ) -> Self {
        PresentationContextNegotiated {
            id: proposed.id,
            abstract_syntax: trim_uid(&proposed.abstract_syntax).to_string(),
            transfer_syntax: None,
            reason,
        }
    }
}

impl From<&PresentationContextNegotiated> for PresentationContextResult {
    fn from(pc: &PresentationContextNegotiated) -> Self {
        PresentationContextResult {
            id: pc.id,
            reason: pc.reason,
            transfer_syntax: pc.transfer_syntax.clone(),
        }
    }
}

/// Decide the outcome of each proposed presentation context.
///
/// For every proposed context, in order:
/// 1. an abstract syntax missing from `supported` is rejected
///    with `AbstractSyntaxNotSupported`;
/// 2. an abstract syntax for which `allow` returns false is rejected
///    with `UserRejection`;
/// 3. otherwise the transfer syntax is chosen according to `priority`,
///    and the context is rejected with `TransferSyntaxesNotSupported`
///    if none of the proposed transfer syntaxes is supported.
pub fn negotiate<F>(
    proposed: &[PresentationContextProposed],
    supported: &SupportedSyntaxes,
    priority: TransferSyntaxPriority,
    mut allow: F,
) -> Vec<PresentationContextNegotiated>
where
    F: FnMut(&str) -> bool,
{
    proposed
        .iter()
        .map(|pc| {
            let Some(supported_ts) = supported.transfer_syntaxes_for(&pc.abstract_syntax) else {
                return PresentationContextNegotiated::rejected(
                    pc,
                    PresentationContextResultReason::AbstractSyntaxNotSupported,
                );
            };

            if !allow(trim_uid(&pc.abstract_syntax)) {
                return PresentationContextNegotiated::rejected(
                    pc,
                    PresentationContextResultReason::UserRejection,
                );
            }

            let chosen = match priority {
                TransferSyntaxPriority::Requestor => pc
                    .transfer_syntaxes
                    .iter()
                    .map(|ts| trim_uid(ts))
                    .find(|ts| supported_ts.iter().any(|s| s == ts)),
                TransferSyntaxPriority::Acceptor => supported_ts
                    .iter()
                    .map(String::as_str)
                    .find(|s| pc.transfer_syntaxes.iter().any(|ts| trim_uid(ts) == *s)),
            };

            match chosen {
                Some(ts) => PresentationContextNegotiated {
                    id: pc.id,
                    abstract_syntax: trim_uid(&pc.abstract_syntax).to_string(),
                    transfer_syntax: Some(ts.to_string()),
                    reason: PresentationContextResultReason::Acceptance,
                },
                None => PresentationContextNegotiated::rejected(
                    pc,
                    PresentationContextResultReason::TransferSyntaxesNotSupported,
                ),
            }
        })
        .collect()
}
