use serde::{Deserialize, Serialize};

use crate::ble::{PacketData, ScanResultInfo};

/// One service data entry of an advertisement, with the payload hex encoded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceData {
    pub uuid: String,
    pub data: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData {
    pub id: String,
    pub data: String,
}

/// A remote device as discovered by a scan.
///
/// Each field is taken from the scan response packet when present there and
/// from the advertising packet otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeDevice {
    pub address: String,
    pub name: Option<String>,
    pub tx_power: Option<i32>,
    pub appearance: Option<u32>,
    pub uuids: Option<Vec<String>>,
    pub solicitation_uuids: Option<Vec<String>>,
    pub service_data: Option<Vec<ServiceData>>,
    pub manufacturer_data: Option<ManufacturerData>,
    pub rssi: i32,
}

fn either<'a, T, F>(info: &'a ScanResultInfo, field: F) -> Option<&'a T>
where
    F: Fn(&'a PacketData) -> Option<&'a T>,
{
    field(&info.scan_response).or_else(|| field(&info.advertising))
}

fn non_empty<T>(list: &[T]) -> Option<&[T]> {
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

impl LeDevice {
    pub fn from_scan_result(info: &ScanResultInfo) -> Self {
        let pick_list = |field: fn(&PacketData) -> &Vec<String>| {
            non_empty(field(&info.scan_response).as_slice())
                .or_else(|| non_empty(field(&info.advertising).as_slice()))
                .map(|list| list.to_vec())
        };

        let service_data = non_empty(info.scan_response.service_data.as_slice())
            .or_else(|| non_empty(info.advertising.service_data.as_slice()))
            .map(|list| {
                list.iter()
                    .map(|(uuid, data)| ServiceData {
                        uuid: uuid.clone(),
                        data: hex::encode(data),
                    })
                    .collect()
            });

        LeDevice {
            address: info.remote_address.clone(),
            name: either(info, |p| p.device_name.as_ref()).cloned(),
            tx_power: either(info, |p| p.tx_power_level.as_ref()).copied(),
            appearance: either(info, |p| p.appearance.as_ref()).copied(),
            uuids: pick_list(|p| &p.service_uuids),
            solicitation_uuids: pick_list(|p| &p.solicitation_uuids),
            service_data,
            manufacturer_data: either(info, |p| p.manufacturer_data.as_ref()).map(|(id, data)| {
                ManufacturerData {
                    id: id.to_string(),
                    data: hex::encode(data),
                }
            }),
            rssi: info.rssi,
        }
    }
}

/// What to put in an advertising (or scan response) packet
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseData {
    pub include_name: bool,
    pub service_uuids: Vec<String>,
    pub solicitation_uuids: Vec<String>,
    pub appearance: Option<u32>,
    pub include_tx_power_level: bool,
    pub service_data: Option<AdvertiseServiceData>,
    pub manufacturer_data: Option<AdvertiseManufacturerData>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseServiceData {
    pub uuid: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseManufacturerData {
    pub id: u16,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseState {
    Started,
    Stopped,
}

impl AdvertiseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvertiseState::Started => "STARTED",
            AdvertiseState::Stopped => "STOPPED",
        }
    }
}
