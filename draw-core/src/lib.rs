use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub type GroupId = String;

/// Length of the public share token, matching the reference link format.
pub const SLUG_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub organiser_email: String,
    pub slug: Option<String>,
    pub locked: bool,
}

impl Group {
    pub fn new(id: impl Into<String>, organiser_email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            organiser_email: organiser_email.into(),
            slug: None,
            locked: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub name: String,
    pub claim_email: Option<String>,
    pub giftee_name: Option<String>,
    pub drawn_at: Option<u64>,
}

impl Participant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            claim_email: None,
            giftee_name: None,
            drawn_at: None,
        }
    }

    pub fn has_drawn(&self) -> bool {
        self.giftee_name.is_some()
    }
}

/// One committed (or locally known) draw, keyed by the gifter's name in an
/// [`AssignmentMap`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub giftee: String,
    pub email: Option<String>,
    pub drawn_at: u64,
}

pub type AssignmentMap = HashMap<String, Assignment>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DrawError {
    #[error("name is empty")]
    EmptyName,
    #[error("that name is already on the list")]
    DuplicateName,
    #[error("name not on the roster")]
    UnknownName,
    #[error("need at least two participants")]
    NotEnoughParticipants,
    #[error("name already claimed by someone else")]
    NameAlreadyClaimed,
    #[error("everyone else has already been matched")]
    ExchangeExhausted,
}

/// Trimmed, case-insensitive name identity used for all roster comparisons.
pub fn same_name(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// The editable participant list, only mutable while a group is open.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Roster {
    names: Vec<String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a roster from raw input, applying the save-time dedup rules.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: dedup_names(names),
        }
    }

    pub fn add(&mut self, name: &str) -> Result<(), DrawError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DrawError::EmptyName);
        }
        if self.names.iter().any(|n| same_name(n, trimmed)) {
            return Err(DrawError::DuplicateName);
        }
        self.names.push(trimmed.to_string());
        Ok(())
    }

    /// Removes a name; returns false when no matching entry existed. Any
    /// assignment referencing the name must be dropped by the caller.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.names.len();
        self.names.retain(|n| !same_name(n, name));
        self.names.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| same_name(n, name))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Save-time de-duplication: trims every entry, drops blanks, and keeps the
/// first occurrence (with its original casing) of each name.
pub fn dedup_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut unique: Vec<String> = Vec::new();
    for name in names {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if !unique.iter().any(|existing| same_name(existing, trimmed)) {
            unique.push(trimmed.to_string());
        }
    }
    unique
}

/// Generates a fresh share token: [`SLUG_LEN`] chars of `[a-z0-9]`.
pub fn generate_slug<R: Rng>(rng: &mut R) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..SLUG_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Merges authoritative participant rows into a local assignment cache.
/// Remote rows carrying a giftee always win; committed draws are read back,
/// so remote is never staler than local. A remote row without a claim email
/// keeps the locally cached email, and a missing timestamp falls back to the
/// local one, then to `now`.
pub fn merge_remote(local: &mut AssignmentMap, remote: &[Participant], now: u64) {
    for row in remote {
        let Some(giftee) = &row.giftee_name else {
            continue;
        };
        let prior = local.get(&row.name);
        let email = row
            .claim_email
            .clone()
            .or_else(|| prior.and_then(|a| a.email.clone()));
        let drawn_at = row
            .drawn_at
            .or_else(|| prior.map(|a| a.drawn_at))
            .unwrap_or(now);
        local.insert(
            row.name.clone(),
            Assignment {
                giftee: giftee.clone(),
                email,
                drawn_at,
            },
        );
    }
}

/// What the engine should do for a claim, decided against the merged view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawPlan {
    /// The name already has a giftee; re-deliver it, never re-randomize.
    Resend { giftee: String },
    /// No giftee yet; commit this pick with the conditional write.
    Fresh { giftee: String },
}

/// Decides a single claim for `name` against the merged assignment view.
///
/// Fresh picks are greedy: uniform over the names not yet taken as anyone's
/// giftee, excluding `name` itself. This is not a derangement solver, so the
/// last drawer can be stranded with only their own name left, surfaced as
/// [`DrawError::ExchangeExhausted`] for the organiser to reset.
pub fn plan_draw<R: Rng>(
    roster: &[String],
    name: &str,
    claim_email: &str,
    assignments: &AssignmentMap,
    rng: &mut R,
) -> Result<DrawPlan, DrawError> {
    if roster.len() < 2 {
        return Err(DrawError::NotEnoughParticipants);
    }
    if !roster.iter().any(|n| same_name(n, name)) {
        return Err(DrawError::UnknownName);
    }

    let claimant = normalize_email(claim_email);

    if let Some(existing) = assignments.get(name) {
        match &existing.email {
            Some(owner) if !owner.is_empty() && *owner != claimant => {
                return Err(DrawError::NameAlreadyClaimed);
            }
            _ => {
                return Ok(DrawPlan::Resend {
                    giftee: existing.giftee.clone(),
                });
            }
        }
    }

    let taken: HashSet<&str> = assignments.values().map(|a| a.giftee.as_str()).collect();
    let candidates: Vec<&String> = roster
        .iter()
        .filter(|n| n.as_str() != name && !taken.contains(n.as_str()))
        .collect();

    match candidates.choose(rng) {
        Some(choice) => Ok(DrawPlan::Fresh {
            giftee: (*choice).clone(),
        }),
        None => Err(DrawError::ExchangeExhausted),
    }
}

/// Organiser unlock gate: a UX deterrent, not an access-control boundary.
/// Compares trimmed and lowercased; an empty stored email matches anything.
pub fn organiser_matches(stored: &str, attempt: &str) -> bool {
    let stored = stored.trim();
    if stored.is_empty() {
        return true;
    }
    stored.to_lowercase() == attempt.trim().to_lowercase()
}
