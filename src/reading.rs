// Device readings as returned by the Qingping device API, and the flat
// record that gets republished over MQTT. The upstream shape wraps every
// metric as `{"value": x}` inside a `data` block; `normalize` strips that
// nesting and keys the result by device MAC.
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Flat reading published as the MQTT payload. Units are whatever the
/// upstream API reports; nothing is validated or range checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    /// Epoch milliseconds of the measurement
    pub timestamp: i64,
    pub battery: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub tvoc: f64,
    pub co2: f64,
    pub pm25: f64,
}

/// Readings of one cycle keyed by device MAC.
pub type Readings = HashMap<String, DeviceReading>;

#[derive(Debug, Default, Deserialize)]
pub struct DeviceList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub devices: Vec<RawDevice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawDevice {
    #[serde(default, deserialize_with = "null_as_default")]
    pub info: RawInfo,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: RawData,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawInfo {
    #[serde(default, deserialize_with = "null_as_default")]
    pub mac: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawData {
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: Wrapped<i64>,
    #[serde(deserialize_with = "null_as_default")]
    pub battery: Wrapped<f64>,
    #[serde(deserialize_with = "null_as_default")]
    pub temperature: Wrapped<f64>,
    #[serde(deserialize_with = "null_as_default")]
    pub humidity: Wrapped<f64>,
    #[serde(deserialize_with = "null_as_default")]
    pub tvoc: Wrapped<f64>,
    #[serde(deserialize_with = "null_as_default")]
    pub co2: Wrapped<f64>,
    #[serde(deserialize_with = "null_as_default")]
    pub pm25: Wrapped<f64>,
}

/// A single metric as `{"value": x}`. The key is matched without regard to
/// case (firmware revisions disagree on `value`/`Value`), other keys such as
/// `status` or `level` are ignored, and a `null` value reads as zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct Wrapped<T> {
    pub value: T,
}

impl<'de, T> Deserialize<'de> for Wrapped<T>
where
    T: DeserializeOwned + Default,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Map::<String, Value>::deserialize(deserializer)?;

        let raw = fields.get("value").or_else(|| {
            fields
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("value"))
                .map(|(_, v)| v)
        });

        let value = match raw {
            None | Some(Value::Null) => T::default(),
            Some(v) => T::deserialize(v).map_err(D::Error::custom)?,
        };

        Ok(Wrapped { value })
    }
}

/// Treat an explicit `null` like an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl From<RawData> for DeviceReading {
    fn from(data: RawData) -> Self {
        DeviceReading {
            timestamp: data.timestamp.value,
            battery: data.battery.value,
            temperature: data.temperature.value,
            humidity: data.humidity.value,
            tvoc: data.tvoc.value,
            co2: data.co2.value,
            pm25: data.pm25.value,
        }
    }
}

/// Flatten the device list into a map keyed by MAC. Devices reporting the
/// same MAC collapse into one entry, the last one in the list wins.
pub fn normalize(list: DeviceList) -> Readings {
    list.devices
        .into_iter()
        .map(|device| (device.info.mac, DeviceReading::from(device.data)))
        .collect()
}
