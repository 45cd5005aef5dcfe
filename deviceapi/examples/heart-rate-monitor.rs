//! Connects to a simulated heart rate monitor and prints measurements until
//! the sensor has sent ten of them or Ctrl-C is pressed.

use std::sync::Arc;
use std::time::Duration;

use deviceapi::ble::CharacteristicProperties;
use deviceapi::fake::ble::{FakeBleBackend, FakeCharacteristic};
use deviceapi::{Listener, SessionConfig};
use log::{info, warn};

const SENSOR: &str = "C0:FF:EE:00:18:0D";
const HEART_RATE_SERVICE: &str = "180d";
const HEART_RATE_MEASUREMENT: &str = "2a37";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let fake = Arc::new(FakeBleBackend::new());
    fake.set_auto_connect(true);
    let service = fake.add_service(SENSOR, HEART_RATE_SERVICE);
    let measurement = fake.add_characteristic(
        service,
        FakeCharacteristic {
            uuid: HEART_RATE_MEASUREMENT.to_string(),
            properties: (CharacteristicProperties::NOTIFY | CharacteristicProperties::READ).bits(),
            descriptors: vec!["2902".to_string()],
            value: vec![0x00, 60],
        },
    );

    let mut config = SessionConfig::new();
    config.set_ble_backend(fake.clone());
    let session = config.start()?;
    let context = session.contexts().create();

    let adapter = session.low_energy_adapter()?;
    adapter.connect(&context, SENSOR).await?;
    info!("Connected to {}", SENSOR);

    let gatt = adapter.get_specified_gatt_service(SENSOR, HEART_RATE_SERVICE)?;
    let characteristics = gatt.characteristics()?;
    let hrm = characteristics
        .iter()
        .find(|c| c.uuid().map(|uuid| uuid == HEART_RATE_MEASUREMENT).unwrap_or(false))
        .ok_or_else(|| anyhow::anyhow!("No heart rate measurement characteristic"))?;

    let (listener, mut measurements) = Listener::channel(&context);
    let id = hrm.add_value_change_listener(listener)?;

    // Plays the sensor's part
    let sensor = fake.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(250));
        for bpm in 60u8..70 {
            interval.tick().await;
            sensor.emit_value_changed(measurement, vec![0x00, bpm]);
        }
    });

    let mut received = 0;
    while received < 10 {
        tokio::select! {
            value = measurements.recv() => match value {
                Some(value) if value.len() >= 2 => {
                    info!("Heart rate: {} bpm", value[1]);
                    received += 1;
                }
                Some(value) => warn!("Short measurement: {:?}", value),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    hrm.remove_value_change_listener(id)?;
    adapter.disconnect(&context, SENSOR).await?;
    info!("Disconnected");
    Ok(())
}
