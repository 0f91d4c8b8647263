//! Tests for ASPI status code coverage
//!
//! These tests verify that:
//! 1. Every SRB status has an operator-facing description
//! 2. Status and command codes keep their ASPI numeric values
//! 3. Wire status bytes line up with SRB status codes

use aspi_bridge::dispatcher::SUPPORT_INFO;
use aspi_bridge::error::describe_status;
use aspi_bridge::wire::status;
use aspi_bridge::{CommandCode, SrbStatus};

// ============================================================================
// Status Descriptions
// ============================================================================

#[test]
fn test_describe_complete() {
    let msg = describe_status(SrbStatus::Complete);
    assert!(msg.contains("successfully"), "Complete should read as success");
}

#[test]
fn test_describe_error_points_at_target_status() {
    let msg = describe_status(SrbStatus::Error);
    assert!(msg.contains("target_status"), "Error should point at the device status");
}

#[test]
fn test_describe_no_device_mentions_override() {
    let msg = describe_status(SrbStatus::NoDevice);
    assert!(msg.contains("SEM_DEVICE"), "NoDevice should name the override variable");
}

#[test]
fn test_every_status_has_description() {
    for code in 0..=u8::MAX {
        if let Some(status) = SrbStatus::from_u8(code) {
            assert!(
                !describe_status(status).is_empty(),
                "Status 0x{:02x} has no description",
                code
            );
        }
    }
}

// ============================================================================
// Numeric Values
// ============================================================================

#[test]
fn test_status_values() {
    assert_eq!(SrbStatus::Pending as u8, 0x00);
    assert_eq!(SrbStatus::Complete as u8, 0x01);
    assert_eq!(SrbStatus::Aborted as u8, 0x02);
    assert_eq!(SrbStatus::AbortFailed as u8, 0x03);
    assert_eq!(SrbStatus::Error as u8, 0x04);
    assert_eq!(SrbStatus::InvalidCommand as u8, 0x80);
    assert_eq!(SrbStatus::InvalidAdapter as u8, 0x81);
    assert_eq!(SrbStatus::NoDevice as u8, 0x82);
}

#[test]
fn test_status_codes_round_trip_through_from_u8() {
    let known = [0x00u8, 0x01, 0x02, 0x03, 0x04, 0x80, 0x81, 0x82];
    for code in 0..=u8::MAX {
        let parsed = SrbStatus::from_u8(code);
        assert_eq!(parsed.is_some(), known.contains(&code), "code 0x{:02x}", code);
        if let Some(status) = parsed {
            assert_eq!(status as u8, code);
        }
    }
}

#[test]
fn test_command_code_values() {
    assert_eq!(CommandCode::AdapterInquiry as u8, 0x00);
    assert_eq!(CommandCode::GetDeviceType as u8, 0x01);
    assert_eq!(CommandCode::ExecuteScsiCommand as u8, 0x02);
    assert_eq!(CommandCode::RescanBus as u8, 0x07);
    assert_eq!(CommandCode::GetSetTimeouts as u8, 0x08);
    assert_eq!(CommandCode::from_u8(0x09), None);
}

#[test]
fn test_wire_status_matches_srb_status() {
    assert_eq!(status::COMPLETE, SrbStatus::Complete as u8);
    assert_eq!(status::ERROR, SrbStatus::Error as u8);
}

#[test]
fn test_support_info_word() {
    assert_eq!(SUPPORT_INFO >> 8, 1, "one host adapter");
    assert_eq!(SUPPORT_INFO & 0xFF, SrbStatus::Complete as u32);
}
