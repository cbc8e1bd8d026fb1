// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the fixed device/port/geometry constants.

use octowatch::constants::{
    H264_PORT, MJPEG_PORT, REMOTE_CONTROL_PORT, REQUEST_POOL_SIZE, Tier,
};

#[test]
fn ports_are_distinct() {
    let ports = [H264_PORT, MJPEG_PORT, REMOTE_CONTROL_PORT];
    for (i, a) in ports.iter().enumerate() {
        for b in &ports[i + 1..] {
            assert_ne!(a, b, "stream adapter ports must not collide");
        }
    }
}

#[test]
fn high_tier_is_higher_resolution_than_low_tier() {
    let (high_w, high_h) = Tier::High.dimensions();
    let (low_w, low_h) = Tier::Low.dimensions();
    assert!(high_w * high_h > low_w * low_h);
}

#[test]
fn request_pool_has_at_least_two_requests() {
    // Double-buffering is the minimum for back-pressure to be meaningful.
    assert!(REQUEST_POOL_SIZE >= 2);
}
