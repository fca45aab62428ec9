use std::fmt;
use std::marker::PhantomData;

use chrono::NaiveDate;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

// ============================================================================
// Channel document (one per chat channel, stored as JSON)
// ============================================================================

/// Color used for a calendar until the channel picks one with `set-color`.
pub const DEFAULT_CALENDAR_COLOR: &str = "#7986cb";

/// Everything a channel has configured: calendars shown by `display`,
/// push subscriptions created by `watch`, and the weekly auto-display day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelDocument {
    #[serde(
        default,
        deserialize_with = "deserialize_registrations",
        skip_serializing_if = "OrderedMap::is_empty"
    )]
    pub display: OrderedMap<CalendarRegistration>,
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub watch: OrderedMap<WatchSubscription>,
    #[serde(
        rename = "autoDisplayTable",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_display: Option<u8>,
    #[serde(
        rename = "autoDisplayLastFired",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_display_last_fired: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarRegistration {
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_color() -> String {
    DEFAULT_CALENDAR_COLOR.to_string()
}

/// A provider push-notification lease for one calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSubscription {
    pub caluuid: String,
    #[serde(deserialize_with = "deserialize_lenient_string")]
    pub token: String,
    #[serde(rename = "resourceID")]
    pub resource_id: String,
    /// Epoch milliseconds. The provider hands this out as a decimal string.
    #[serde(
        default,
        deserialize_with = "deserialize_expiration",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiration: Option<i64>,
}

impl WatchSubscription {
    /// A subscription still delivers notifications until its expiration.
    /// Records without an expiration are treated as live.
    pub fn is_active_at(&self, now_ms: i64) -> bool {
        self.expiration.map_or(true, |expiration| expiration > now_ms)
    }

    /// True when the lease runs out within `threshold_ms` of `now_ms`, or when
    /// the expiration was never recorded.
    pub fn needs_renewal(&self, now_ms: i64, threshold_ms: i64) -> bool {
        self.expiration
            .map_or(true, |expiration| expiration - now_ms <= threshold_ms)
    }
}

// ============================================================================
// Insertion-ordered string map
// ============================================================================

/// JSON object keyed by calendar id that remembers insertion order.
///
/// Registration order decides calendar enumeration order (and therefore the
/// tie-break between events starting at the same instant), so a plain
/// `HashMap`/`BTreeMap` won't do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Insert or overwrite. Overwriting keeps the key's original position.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        match self.get_mut(&key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<V> FromIterator<(String, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut map = OrderedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a JSON object keyed by calendar id")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut map = OrderedMap::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    map.insert(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

// ============================================================================
// Lenient field decoders (legacy documents)
// ============================================================================

/// Older documents stored `display` as a bare list of calendar ids.
fn deserialize_registrations<'de, D>(
    deserializer: D,
) -> Result<OrderedMap<CalendarRegistration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDisplay {
        Map(OrderedMap<CalendarRegistration>),
        List(Vec<String>),
    }

    Ok(match RawDisplay::deserialize(deserializer)? {
        RawDisplay::Map(map) => map,
        RawDisplay::List(ids) => ids
            .into_iter()
            .map(|id| {
                let registration = CalendarRegistration {
                    name: id.clone(),
                    color: default_color(),
                };
                (id, registration)
            })
            .collect(),
    })
}

struct LenientStringVisitor;

impl<'de> Visitor<'de> for LenientStringVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string or an integer")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(v.to_string())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(v.to_string())
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(v.to_string())
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(v)
    }
}

fn deserialize_lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(LenientStringVisitor)
}

/// Accepts epoch milliseconds as a number, a numeric string or null.
pub fn deserialize_expiration<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ExpirationVisitor;

    impl<'de> Visitor<'de> for ExpirationVisitor {
        type Value = Option<i64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("epoch milliseconds as a number or numeric string")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            i64::try_from(v)
                .map(Some)
                .map_err(|_| E::custom(format!("expiration out of range: {}", v)))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            v.trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|e| E::custom(format!("invalid expiration string: {}", e)))
        }
    }

    deserializer.deserialize_any(ExpirationVisitor)
}
