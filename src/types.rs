//! Shared value types: timestamps, decimal amounts and actors
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Year-month key (`YYYYMM`) used to scope monthly document numbers.
    pub fn period_key(&self) -> String {
        self.0.format("%Y%m").to_string()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
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

// Decimal has no minicbor impls, so amounts travel through newtypes that
// encode the canonical string form (exact, scale preserved).
macro_rules! decimal_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Decimal);

        impl $name {
            pub const ZERO: Self = Self(Decimal::ZERO);

            pub fn new(value: Decimal) -> Self {
                Self(value)
            }
            pub fn value(&self) -> Decimal {
                self.0
            }
        }

        impl From<Decimal> for $name {
            fn from(value: Decimal) -> Self {
                Self(value)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(Decimal::from(value))
            }
        }

        impl FromStr for $name {
            type Err = rust_decimal::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Decimal::from_str(s.trim()).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl<C> minicbor::Encode<C> for $name {
            fn encode<W: minicbor::encode::Write>(
                &self,
                e: &mut minicbor::Encoder<W>,
                _: &mut C,
            ) -> Result<(), minicbor::encode::Error<W::Error>> {
                e.str(&self.0.to_string())?.ok()
            }
        }

        impl<'b, C> minicbor::Decode<'b, C> for $name {
            fn decode(
                d: &mut minicbor::Decoder<'b>,
                _: &mut C,
            ) -> Result<Self, minicbor::decode::Error> {
                let raw = d.str()?;
                Decimal::from_str(raw)
                    .map(Self)
                    .map_err(|_| minicbor::decode::Error::message("invalid decimal string"))
            }
        }
    };
}

decimal_newtype!(
    /// A monetary amount in the school's base currency.
    Money
);
decimal_newtype!(
    /// A percentage in `[0, 100]`.
    Percent
);

/// Roles handed to the engine by the upstream auth layer.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    #[n(0)]
    Admin,
    #[n(1)]
    Accountant,
    #[n(2)]
    Principal,
    #[n(3)]
    VicePrincipal,
    #[n(4)]
    Teacher,
    #[n(5)]
    Staff,
    #[n(6)]
    Student,
    #[n(7)]
    Parent,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::Admin,
        Role::Accountant,
        Role::Principal,
        Role::VicePrincipal,
        Role::Teacher,
        Role::Staff,
        Role::Student,
        Role::Parent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "Admin",
            Self::Accountant => "Accountant",
            Self::Principal => "Principal",
            Self::VicePrincipal => "VP",
            Self::Teacher => "Teacher",
            Self::Staff => "Staff",
            Self::Student => "Student",
            Self::Parent => "Parent",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "accountant" => Ok(Self::Accountant),
            "principal" => Ok(Self::Principal),
            "vp" | "vice principal" | "vice_principal" => Ok(Self::VicePrincipal),
            "teacher" => Ok(Self::Teacher),
            "staff" => Ok(Self::Staff),
            "student" => Ok(Self::Student),
            "parent" => Ok(Self::Parent),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The caller of an operation, as resolved by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}
