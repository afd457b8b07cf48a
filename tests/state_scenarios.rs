mod common;

use camhal::display::ChannelWindow;
use camhal::driver::{DriverCall, Fault};
use camhal::state_machine::State;
use camhal::{HalConfig, HalError};

use common::{rig, rig_with, WAIT};

fn is_channel_call(call: &DriverCall) -> bool {
    matches!(call, DriverCall::StartChannel(_) | DriverCall::StopChannel(_))
}

#[test]
fn preview_waits_for_a_window() {
    let r = rig();
    r.cam.start_preview().unwrap();
    assert_eq!(r.cam.state(), State::PreviewReady);
    assert!(r.cam.preview_enabled().unwrap());
    assert_eq!(r.driver.num_channels(), 0);

    let (window, frames) = ChannelWindow::new(2, 8);
    r.cam.set_preview_window(Some(window)).unwrap();
    assert_eq!(r.cam.state(), State::Previewing);
    frames.recv_timeout(WAIT).unwrap();

    r.cam.stop_preview().unwrap();
    assert_eq!(r.cam.state(), State::PreviewStopped);
    r.assert_buffers_balanced();
}

#[test]
fn picture_ends_in_stopped_without_cancel() {
    let r = rig();
    r.cam.start_no_display_preview().unwrap();
    r.clear_states();
    r.cam.take_picture().unwrap();

    // the next two transitions, in order
    r.wait_state(State::PictureTaking);
    r.wait_state(State::PreviewStopped);
    assert_eq!(r.cam.state(), State::PreviewStopped);
    r.assert_buffers_balanced();
}

#[test]
fn restart_while_recording_when_allowed() {
    let mut config = HalConfig::default();
    config.state_machine.allow_restart_while_recording = true;
    let r = rig_with(config);
    r.cam.start_no_display_preview().unwrap();
    r.cam.start_recording().unwrap();
    r.driver.clear_calls();

    r.cam.set_parameters("preview-size=320x240").unwrap();
    assert_eq!(r.cam.state(), State::Recording);
    let calls = r.driver.calls();
    assert!(calls.iter().any(|c| matches!(c, DriverCall::StopChannel(_))));
    assert!(calls.iter().any(|c| matches!(c, DriverCall::StartChannel(_))));
    assert_eq!(r.driver.parms().get("preview-size").map(String::as_str), Some("320x240"));
    assert!(r.cam.get_parameters().unwrap().contains("preview-size=320x240"));

    r.cam.stop_recording().unwrap();
    r.cam.stop_preview().unwrap();
    r.assert_buffers_balanced();
}

#[test]
fn restart_while_recording_is_refused_by_default() {
    let r = rig();
    r.cam.start_no_display_preview().unwrap();
    r.cam.start_recording().unwrap();
    r.driver.clear_calls();

    let err = r.cam.set_parameters("preview-size=320x240").unwrap_err();
    assert!(matches!(err, HalError::BadValue(_)));
    assert_eq!(r.cam.state(), State::Recording);
    assert!(!r.driver.calls().iter().any(is_channel_call));
    assert!(r.cam.get_parameters().unwrap().contains("preview-size=640x480"));

    // changes that need no restart still go through
    r.cam.set_parameters("jpeg-quality=70").unwrap();
    assert!(r.cam.get_parameters().unwrap().contains("jpeg-quality=70"));
}

#[test]
fn invalid_calls_leave_state_alone() {
    let r = rig();
    let invalid = |res: Result<(), HalError>| matches!(res, Err(HalError::InvalidOperation(_)));

    assert!(invalid(r.cam.take_picture()));
    assert!(invalid(r.cam.start_recording()));
    assert!(invalid(r.cam.cancel_picture()));
    assert_eq!(r.cam.state(), State::PreviewStopped);

    r.cam.start_no_display_preview().unwrap();
    assert!(invalid(r.cam.cancel_picture()));
    assert!(invalid(r.cam.stop_recording()));
    assert_eq!(r.cam.state(), State::Previewing);

    r.cam.start_recording().unwrap();
    assert!(invalid(r.cam.stop_preview()));
    assert_eq!(r.cam.state(), State::Recording);
    assert!(r.cam.recording_enabled().unwrap());
}

#[test]
fn start_stop_start_matches_first_start() {
    let r = rig();
    r.cam.start_no_display_preview().unwrap();
    let first = r.cam.state();
    let channels = r.driver.num_channels();
    r.cam.stop_preview().unwrap();
    assert_eq!(r.driver.num_channels(), 0);
    r.cam.start_no_display_preview().unwrap();
    assert_eq!(r.cam.state(), first);
    assert_eq!(r.driver.num_channels(), channels);
}

#[test]
fn failed_preview_start_stays_stopped() {
    let r = rig();
    r.driver.inject(Fault::StartChannel);
    assert!(r.cam.start_no_display_preview().is_err());
    assert_eq!(r.cam.state(), State::PreviewStopped);
    assert_eq!(r.driver.num_channels(), 0);
    r.assert_buffers_balanced();

    r.driver.clear_fault(Fault::StartChannel);
    r.cam.start_no_display_preview().unwrap();
    assert_eq!(r.cam.state(), State::Previewing);
}

#[test]
fn failed_restart_falls_back_to_stopped() {
    let r = rig();
    r.cam.start_no_display_preview().unwrap();
    r.driver.inject(Fault::StartChannel);
    assert!(r.cam.set_parameters("preview-size=320x240").is_err());
    assert_eq!(r.cam.state(), State::PreviewStopped);
    r.assert_buffers_balanced();
}

#[test]
fn rejected_parameters_are_not_applied() {
    let r = rig();
    let before = r.cam.get_parameters().unwrap();
    assert!(r.cam.set_parameters("preview-size=123x45").is_err());
    assert!(r.cam.set_parameters("zoom=999").is_err());
    assert_eq!(r.cam.get_parameters().unwrap(), before);
    r.cam.put_parameters(before).unwrap();
}

#[test]
fn failed_reprocess_setup_takes_preview_down() {
    let mut config = HalConfig::default();
    config.postproc.reprocess = true;
    let r = rig_with(config);
    r.cam.start_no_display_preview().unwrap();
    assert!(r.driver.num_channels() > 0);

    // the reprocess channel is built before preview is stopped
    r.driver.inject(Fault::AddChannel);
    assert!(r.cam.take_picture().is_err());
    assert_eq!(r.cam.state(), State::PreviewStopped);
    assert_eq!(r.driver.num_channels(), 0);
    r.assert_buffers_balanced();

    r.driver.clear_fault(Fault::AddChannel);
    r.cam.start_no_display_preview().unwrap();
    assert_eq!(r.cam.state(), State::Previewing);
}

#[test]
fn failed_capture_channel_leaves_nothing_running() {
    let r = rig();
    r.cam.start_no_display_preview().unwrap();
    r.driver.inject(Fault::AddChannel);
    assert!(r.cam.take_picture().is_err());
    assert_eq!(r.cam.state(), State::PreviewStopped);
    assert_eq!(r.driver.num_channels(), 0);
    r.assert_buffers_balanced();
}
