//! Roles, entity kinds, caller identity and timestamps shared by every module
use super::error::PortalError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hub roles. The set is closed: anything the identity provider hands us
/// must parse into one of these or the request is refused.
#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[n(0)]
    Admin,
    #[n(1)]
    Manager,
    #[n(2)]
    Contractor,
    #[n(3)]
    Customer,
    #[n(4)]
    Center,
    #[n(5)]
    Crew,
    #[n(6)]
    Warehouse,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Admin,
        Role::Manager,
        Role::Contractor,
        Role::Customer,
        Role::Center,
        Role::Crew,
        Role::Warehouse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Contractor => "contractor",
            Role::Customer => "customer",
            Role::Center => "center",
            Role::Crew => "crew",
            Role::Warehouse => "warehouse",
        }
    }

    /// The directory entity a user of this role is. Admins live outside the hierarchy.
    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            Role::Admin => None,
            Role::Manager => Some(EntityKind::Manager),
            Role::Contractor => Some(EntityKind::Contractor),
            Role::Customer => Some(EntityKind::Customer),
            Role::Center => Some(EntityKind::Center),
            Role::Crew => Some(EntityKind::Crew),
            Role::Warehouse => Some(EntityKind::Warehouse),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PortalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PortalError::InvalidInput(format!("unknown role '{s}'")))
    }
}

/// Everything that can be stored, linked, archived or targeted by an activity.
#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[n(0)]
    Manager,
    #[n(1)]
    Contractor,
    #[n(2)]
    Customer,
    #[n(3)]
    Center,
    #[n(4)]
    Crew,
    #[n(5)]
    Warehouse,
    #[n(6)]
    Service,
    #[n(7)]
    Order,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Manager,
        EntityKind::Contractor,
        EntityKind::Customer,
        EntityKind::Center,
        EntityKind::Crew,
        EntityKind::Warehouse,
        EntityKind::Service,
        EntityKind::Order,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Manager => "manager",
            EntityKind::Contractor => "contractor",
            EntityKind::Customer => "customer",
            EntityKind::Center => "center",
            EntityKind::Crew => "crew",
            EntityKind::Warehouse => "warehouse",
            EntityKind::Service => "service",
            EntityKind::Order => "order",
        }
    }

    /// The kind that owns this one in the hierarchy, if any.
    pub fn owner_kind(&self) -> Option<EntityKind> {
        match self {
            EntityKind::Contractor => Some(EntityKind::Manager),
            EntityKind::Customer => Some(EntityKind::Contractor),
            EntityKind::Center => Some(EntityKind::Customer),
            EntityKind::Crew => Some(EntityKind::Center),
            EntityKind::Warehouse => Some(EntityKind::Contractor),
            EntityKind::Service => Some(EntityKind::Center),
            EntityKind::Manager | EntityKind::Order => None,
        }
    }

    /// The hub role whose users are entities of this kind.
    pub fn role(&self) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|r| r.entity_kind() == Some(*self))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = PortalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PortalError::InvalidInput(format!("unknown entity type '{s}'")))
    }
}

/// A typed pointer at a stored entity. Links between records are always
/// expressed as one of these, never as free-form keys.
#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
pub struct EntityRef {
    #[n(0)]
    pub kind: EntityKind,
    #[n(1)]
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// A verified caller, as handed to us by the upstream identity middleware.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
    /// The directory entity behind this caller, if the role has one.
    pub fn entity_ref(&self) -> Option<EntityRef> {
        self.role
            .entity_kind()
            .map(|kind| EntityRef::new(kind, self.user_id.clone()))
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>)
where
    T::Offset: Copy;

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_default()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Saturates at the latest representable instant.
    pub fn plus_days(&self, days: i64) -> Self {
        let later = Duration::try_days(days).and_then(|d| self.0.checked_add_signed(d));
        Self(later.unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
    /// Big-endian nanoseconds, so byte order matches time order in sled keys.
    pub fn sort_key(&self) -> [u8; 8] {
        let nanos = self.0.timestamp_nanos_opt().unwrap_or(i64::MAX);
        // flip the sign bit so negative instants still sort first
        ((nanos as u64) ^ (1 << 63)).to_be_bytes()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T>
where
    T::Offset: Copy,
{
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn sort_key_follows_time_order() {
        let early = TimeStamp::new_with(2024, 1, 1, 0, 0, 0);
        let late = early.plus_days(1);

        assert!(early.sort_key() < late.sort_key());
    }

    #[test]
    fn plus_days_saturates_instead_of_panicking() {
        let now = TimeStamp::new_with(2025, 1, 1, 0, 0, 0);
        let far = now.plus_days(i64::MAX);

        assert_eq!(far.to_datetime_utc(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("Warehouse".parse::<Role>().unwrap(), Role::Warehouse);
        assert!("overlord".parse::<Role>().is_err());
        assert_eq!(Role::Admin.entity_kind(), None);
        assert_eq!(Role::Crew.entity_kind(), Some(EntityKind::Crew));
    }
}
