//! Register Block Protocol Tests
//!
//! Exercises the ADC register block, channel masks and counter loads through
//! the device table and the simulated board.
//!
//! # Test Coverage
//!
//! | Test | Description |
//! |------|-------------|
//! | `test_config_round_trip_through_device` | Write, read back and compare both layouts |
//! | `test_corrupt_readback_is_corrected` | Out-of-range registers are repaired on read |
//! | `test_short_readback_rejected` | Truncated GET_CONFIG is `InvalidData` |
//! | `test_gain_code_error_order` | Parameter checks fire in a fixed order |
//! | `test_mux_gain_groups` | Channels share registers in groups of `channels_per_group` |
//! | `test_channel_mask_forms_agree` | Integer, bit string and group access agree |
//! | `test_mux_immediate_scan` | Immediate scan over high MUX channels with grouped gains |
//! | `test_counter_mode_load_encoding` | wValue/wIndex of 8254 mode-load requests |
//! | `test_error_codes_are_negative` | Every error maps to a negative status code |

use std::sync::Arc;
use std::time::Duration;

use daq_driver_aiousb::config_block::AD_CONFIG_CAL_MODE;
use daq_driver_aiousb::transport::{
    AUR_ADC_IMMEDIATE, AUR_ADC_SET_CONFIG, AUR_CTR_MODELOAD, AUR_START_ACQUIRING_BLOCK,
    USB_READ_FROM_DEVICE, USB_WRITE_TO_DEVICE,
};
use daq_driver_aiousb::{
    load_counter, AdcConfigBlock, AiousbError, CalMode, ChannelMask, DeviceGeometry, DeviceRecord,
    DeviceTable, GainCode, MockSignal, MockTransport, Transport, TriggerMode,
};

// =============================================================================
// Register Block
// =============================================================================

#[test]
fn test_config_round_trip_through_device() {
    for geometry in [DeviceGeometry::non_mux(16), DeviceGeometry::mux(64, 4)] {
        let transport = Arc::new(MockTransport::new(MockSignal::Ramp));
        let devices = DeviceTable::new();
        let index = devices
            .insert(DeviceRecord::new(
                geometry,
                Arc::clone(&transport) as Arc<dyn Transport>,
            ))
            .unwrap();

        let mut block = devices.config_block(index).unwrap();
        block.set_gain_code(1, GainCode::Bipolar5V as u8).unwrap();
        block.set_differential_mode(1, true).unwrap();
        block.set_cal_mode(CalMode::Reference).unwrap();
        block
            .set_trigger_mode((TriggerMode::EXTERNAL | TriggerMode::FALLING_EDGE).bits())
            .unwrap();
        block.set_oversample(12).unwrap();
        block.set_scan_range(3, 9).unwrap();
        block.write_to_device(transport.as_ref()).unwrap();

        let log = transport.control_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].request_type, USB_WRITE_TO_DEVICE);
        assert_eq!(log[0].request, AUR_ADC_SET_CONFIG);
        assert_eq!(log[0].data.len(), geometry.config_bytes);

        let read = devices.read_config_block(index).unwrap();
        assert_eq!(read.as_bytes(), block.as_bytes());
        assert_eq!(read.cal_mode().unwrap(), CalMode::Reference);
        assert_eq!(read.start_channel(), 3);
        assert_eq!(read.end_channel(), 9);
        assert_eq!(read.oversample(), 12);
        assert!(read.is_differential(1));
        assert_eq!(devices.config_block(index).unwrap().as_bytes(), block.as_bytes());
    }
}

#[test]
fn test_corrupt_readback_is_corrected() {
    let geometry = DeviceGeometry::non_mux(16);
    let transport = MockTransport::new(MockSignal::Ramp);
    let mut raw = [0u8; 20];
    raw[0] = 0xF3;
    raw[AD_CONFIG_CAL_MODE] = 2;
    raw[17] = 0xFF;
    raw[18] = 0x0F; // start 15, end 0
    transport.set_config_block(&raw);

    let block = AdcConfigBlock::read_from_device(&transport, &geometry).unwrap();
    assert_eq!(block.gain_code(0), GainCode::default());
    assert_eq!(block.cal_mode().unwrap(), CalMode::Normal);
    assert_eq!(block.trigger_mode(), TriggerMode::empty());
    assert_eq!(block.start_channel(), 0);
    assert_eq!(block.end_channel(), 15);
}

#[test]
fn test_short_readback_rejected() {
    let transport = MockTransport::new(MockSignal::Ramp);
    transport.set_config_block(&[0u8; 7]);
    let err = AdcConfigBlock::read_from_device(&transport, &DeviceGeometry::non_mux(16))
        .unwrap_err();
    assert!(matches!(err, AiousbError::InvalidData { .. }));
}

#[test]
fn test_gain_code_error_order() {
    let mut uninitialized = AdcConfigBlock::default();
    assert!(matches!(
        uninitialized.set_gain_code(99, 99),
        Err(AiousbError::InvalidData { .. })
    ));

    let mut block = AdcConfigBlock::from_device(&DeviceGeometry::non_mux(16));
    assert!(matches!(
        block.set_gain_code(99, 8),
        Err(AiousbError::InvalidParameter { .. })
    ));
    assert!(matches!(
        block.set_gain_code(16, 1),
        Err(AiousbError::InvalidParameter { .. })
    ));
    block.set_gain_code(15, 7).unwrap();
    assert_eq!(block.gain_code(15), GainCode::Bipolar1V);
}

#[test]
fn test_mux_gain_groups() {
    let mut block = AdcConfigBlock::from_device(&DeviceGeometry::mux(64, 4));
    block.set_gain_code(5, GainCode::Unipolar2V as u8).unwrap();
    // Channels 4..8 share register 1
    for channel in 4..8 {
        assert_eq!(block.gain_code(channel), GainCode::Unipolar2V);
    }
    assert_eq!(block.gain_code(3), GainCode::Unipolar10V);
    assert_eq!(block.gain_code(8), GainCode::Unipolar10V);
    assert_eq!(block.register(1), Some(GainCode::Unipolar2V as u8));
}

// =============================================================================
// Channel Mask
// =============================================================================

#[test]
fn test_channel_mask_forms_agree() {
    let mut from_int = ChannelMask::new(32).unwrap();
    from_int.set_from_integer(0x8000_0101).unwrap();

    let mut from_text = ChannelMask::new(32).unwrap();
    from_text
        .set_from_bit_string("10000000000000000000000100000001")
        .unwrap();

    assert_eq!(from_int.to_bit_string(), from_text.to_bit_string());
    assert_eq!(from_int.indices().collect::<Vec<_>>(), vec![0, 8, 31]);
    assert_eq!(from_int.group_at(0).unwrap(), 0x80);
    assert_eq!(from_int.group_at(3).unwrap(), 0x01);

    let mut cursor = 0;
    let mut walked = Vec::new();
    while let Some(channel) = from_text.next_active_index(&mut cursor) {
        walked.push(channel);
    }
    assert_eq!(walked, vec![0, 8, 31]);

    assert!(from_text.set_from_bit_string("101").is_err());
    assert!(ChannelMask::new(16).unwrap().set_from_integer(1).is_err());
}

// =============================================================================
// Immediate Scan
// =============================================================================

#[test]
fn test_mux_immediate_scan() {
    let transport = Arc::new(MockTransport::new(MockSignal::Constant(32768)));
    let devices = DeviceTable::new();
    let index = devices
        .insert(DeviceRecord::new(
            DeviceGeometry::mux(64, 4),
            Arc::clone(&transport) as Arc<dyn Transport>,
        ))
        .unwrap();

    let mut block = devices.config_block(index).unwrap();
    block.set_scan_range(20, 35).unwrap();
    block.set_gain_code(21, GainCode::Bipolar10V as u8).unwrap();
    devices.set_config_block(index, &block).unwrap();

    let counts = devices.read_scan_counts(index).unwrap();
    assert_eq!(counts.len(), 64);
    assert!(counts[20..=35].iter().all(|&c| c == 32768));
    assert!(counts[..20].iter().chain(&counts[36..]).all(|&c| c == 0));

    // Channels 20..=23 share the bipolar register, the rest read 0..10 V
    let volts = devices.read_scan_volts(index).unwrap();
    assert!(volts[20..24].iter().all(|v| v.abs() < 1e-9));
    assert!(volts[24..=35].iter().all(|v| (v - 5.0).abs() < 1e-9));
    assert_eq!(volts[36], 0.0);

    let log = transport.control_log();
    let start = log
        .iter()
        .find(|r| r.request == AUR_START_ACQUIRING_BLOCK)
        .unwrap();
    assert_eq!((start.value, start.index), (0, 16));
    let trigger = log.iter().find(|r| r.request == AUR_ADC_IMMEDIATE).unwrap();
    assert_eq!(trigger.request_type, USB_READ_FROM_DEVICE);
    assert_eq!(devices.config_block(index).unwrap(), block);
}

// =============================================================================
// Counters and Errors
// =============================================================================

#[test]
fn test_counter_mode_load_encoding() {
    let transport = MockTransport::new(MockSignal::Ramp);
    load_counter(&transport, 1, 2, 3, 0x1234, Duration::from_millis(5)).unwrap();
    let log = transport.control_log();
    assert_eq!(log[0].request, AUR_CTR_MODELOAD);
    assert_eq!(log[0].value, (2 << 14) | (3 << 12) | (3 << 9) | 1);
    assert_eq!(log[0].index, 0x1234);

    assert!(load_counter(&transport, 0, 3, 0, 1, Duration::ZERO).is_err());
    assert!(load_counter(&transport, 0, 0, 6, 1, Duration::ZERO).is_err());
    assert_eq!(transport.control_log().len(), 1);
}

#[test]
fn test_error_codes_are_negative() {
    let errors = [
        AiousbError::InvalidParameter {
            message: String::new(),
        },
        AiousbError::DeviceNotFound { index: 3 },
        AiousbError::Transport {
            code: 12,
            message: String::new(),
        },
        AiousbError::Transport {
            code: i32::MIN,
            message: String::new(),
        },
        AiousbError::WorkerPanicked,
    ];
    for err in errors {
        assert!(err.code() < 0, "{err} -> {}", err.code());
    }
}
