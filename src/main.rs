use anyhow::{Context, Result};
use esp_idf_svc::bt::BtDriver;
use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::{error, info, warn};

use supercompass::ble_server::{self, BleServer};
use supercompass::config::LOOP_INTERVAL_MS;
use supercompass::location_storage::NvsLocationStore;
use supercompass::service::CompassBleService;
use supercompass::storage::LocationStore;

fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("SuperCompass firmware starting");

    let peripherals = Peripherals::take().context("failed to take peripherals")?;
    let nvs_partition = EspDefaultNvsPartition::take().context("failed to take NVS partition")?;

    let mut store = NvsLocationStore::new(nvs_partition.clone())?;

    let mut service = CompassBleService::new();
    match service.load_locations(&mut store) {
        Ok(count) => info!("starting with {} saved locations", count),
        Err(e) => warn!("could not load saved locations, starting empty: {:#}", e),
    }

    let bt_driver = BtDriver::new(peripherals.modem, Some(nvs_partition))
        .context("failed to initialize BT driver")?;
    let _server = BleServer::start(bt_driver, service)
        .map_err(|e| anyhow::anyhow!("failed to start BLE server: {}", e))?;

    info!("BLE server up, entering main loop");

    let mut loops: u32 = 0;
    loop {
        let now_ms = ble_server::now_ms();
        let actions = ble_server::with_service(|svc| svc.tick(now_ms, &mut store));
        let Some(actions) = actions else {
            error!("service state unavailable, retrying");
            FreeRtos::delay_ms(LOOP_INTERVAL_MS);
            continue;
        };

        if actions.restart_advertising {
            // Issued unconditionally: a controller can drop advertising
            // without an event, and a redundant start is harmless.
            if let Err(e) = ble_server::start_advertising() {
                warn!("watchdog advertising restart failed: {}", e);
            }
        }

        if let Some(msg) = actions.notify {
            if let Err(e) = ble_server::notify(&msg) {
                warn!("notification failed: {}", e);
                ble_server::with_service(|svc| svc.note_notify_failure());
            }
        }

        if let Some(popup) = actions.popup {
            // The display task renders these; until it lands the event is at
            // least visible in the log.
            info!("popup: {} ({} ms)", popup.message, popup.duration_ms);
        }

        // Keep plain GATT reads roughly in step with notifications.
        loops = loops.wrapping_add(1);
        if loops % 20 == 0 {
            ble_server::refresh_read_values();
        }

        FreeRtos::delay_ms(LOOP_INTERVAL_MS);
    }
}
