use std::sync::atomic::Ordering;

use cv_imgproc::FloatImage;
use cv_video::{save_csv, save_log, wrap_angle, KltTracker, TrackStatus, TrackerParams, UNKNOWN_WGM};
use image::{GrayImage, Luma};
use nalgebra::Point2;

const RADIUS: f32 = 10.0;
const BACKGROUND: u8 = 130;

/// Half dark, half light disc; `angle` is the direction of the dividing
/// diameter.
fn render_target(w: u32, h: u32, cx: f32, cy: f32, angle: f32) -> GrayImage {
    let (s, c) = angle.sin_cos();
    let mut img = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for sy in 0..3 {
                for sx in 0..3 {
                    let dx = x as f32 + (sx as f32 - 1.0) / 3.0 - cx;
                    let dy = y as f32 + (sy as f32 - 1.0) / 3.0 - cy;
                    acc += if dx * dx + dy * dy < RADIUS * RADIUS {
                        if -s * dx + c * dy < 0.0 {
                            30.0
                        } else {
                            225.0
                        }
                    } else {
                        BACKGROUND as f32
                    };
                }
            }
            img.put_pixel(x, y, Luma([(acc / 9.0).round() as u8]));
        }
    }
    img
}

fn blank(w: u32, h: u32) -> GrayImage {
    GrayImage::from_pixel(w, h, Luma([BACKGROUND]))
}

fn tracker() -> KltTracker {
    KltTracker::new(RADIUS, TrackerParams::default()).unwrap()
}

#[test]
fn static_target_stays_active() {
    let frame = render_target(96, 96, 48.0, 48.0, 0.4);
    let mut t = tracker();
    let mut wgm = FloatImage::new(96, 96);
    wgm.data.iter_mut().for_each(|v| *v = 2.0);
    t.set_warp_gradient(wgm);

    t.next_frame(frame.clone()).unwrap();
    t.activate(Point2::new(48.0, 48.0), 0).unwrap();
    assert_eq!(t.status(), TrackStatus::Active);

    for i in 1..=4u64 {
        t.next_frame(frame.clone()).unwrap();
        assert!(t.track(i * 40, true).unwrap());
        assert_eq!(t.status(), TrackStatus::Active);
        assert!(t.error() > 0.99, "ncc {}", t.error());
        assert!((t.position() - Point2::new(48.0, 48.0)).norm() < 0.05);
    }
    assert_eq!(t.history().len(), 5);
    assert!(t.history().entries().iter().all(|e| e.warp_gradient_magnitude == 2.0));
}

#[test]
fn blank_frames_lose_the_target() {
    let mut t = tracker();
    t.next_frame(render_target(96, 96, 48.0, 48.0, 0.4)).unwrap();
    t.activate(Point2::new(48.0, 48.0), 0).unwrap();

    t.next_frame(blank(96, 96)).unwrap();
    assert!(!t.track(40, true).unwrap());
    assert_eq!(t.status(), TrackStatus::JustLost);
    assert!(!t.do_inactive_processing(40).unwrap());
    assert_eq!(t.status(), TrackStatus::Lost);

    t.next_frame(blank(96, 96)).unwrap();
    assert!(!t.track(80, true).unwrap());
    assert!(!t.do_inactive_processing(80).unwrap());
    assert_eq!(t.status(), TrackStatus::Lost);
    assert_eq!(t.history().len(), 1);
}

#[test]
fn lost_target_is_relocalized_where_motion_appears() {
    let (w, h) = (120, 100);
    let mut t = tracker();
    t.next_frame(render_target(w, h, 35.0, 40.0, -0.2)).unwrap();
    t.activate(Point2::new(35.0, 40.0), 0).unwrap();

    t.next_frame(blank(w, h)).unwrap();
    assert!(!t.track(40, false).unwrap());

    let reappeared = render_target(w, h, 80.0, 60.0, -0.2);
    t.next_frame(reappeared.clone()).unwrap();
    assert!(t.do_inactive_processing(80).unwrap());
    assert_eq!(t.status(), TrackStatus::Active);
    assert!((t.position() - Point2::new(80.0, 60.0)).norm() < 1e-3);
    assert_eq!(t.history().len(), 2);

    t.next_frame(reappeared).unwrap();
    assert!(t.track(120, true).unwrap());
    assert!((t.position() - Point2::new(80.0, 60.0)).norm() < 0.05);
}

#[test]
fn cancelled_search_finds_nothing() {
    let (w, h) = (96, 96);
    let mut t = tracker();
    t.next_frame(render_target(w, h, 30.0, 30.0, 0.0)).unwrap();
    t.activate(Point2::new(30.0, 30.0), 0).unwrap();
    t.next_frame(blank(w, h)).unwrap();
    assert!(!t.track(40, true).unwrap());
    t.next_frame(render_target(w, h, 60.0, 64.0, 0.0)).unwrap();

    let cancel = t.cancel_handle();
    cancel.store(true, Ordering::Relaxed);
    assert!(!t.do_inactive_processing(80).unwrap());
    assert_eq!(t.status(), TrackStatus::Lost);
    assert!(!cancel.load(Ordering::Relaxed));

    assert!(t.do_inactive_processing(80).unwrap());
    assert!((t.position() - Point2::new(60.0, 64.0)).norm() < 1e-3);
}

#[test]
fn follows_a_moving_target() {
    let (w, h) = (128, 96);
    let start = Point2::new(40.0f32, 44.0f32);
    let mut t = tracker();
    t.next_frame(render_target(w, h, start.x, start.y, 0.3)).unwrap();
    t.activate(start, 0).unwrap();

    for i in 1..=6u64 {
        let truth = Point2::new(start.x + 1.5 * i as f32, start.y + 1.0 * i as f32);
        t.next_frame(render_target(w, h, truth.x, truth.y, 0.3)).unwrap();
        assert!(t.track(i * 40, true).unwrap(), "frame {i}");
        let err = (t.position() - truth).norm();
        assert!(err < 0.35, "frame {i}: off by {err}");
        assert!(t.error() > 0.9);
    }

    // scrub back to the third frame
    assert!(t.rewind(120));
    assert_eq!(t.history().len(), 4);
    assert_eq!(t.position(), t.history().entries()[3].position);
    assert!(t.rewind(0));
    assert_eq!(t.history().len(), 1);
}

#[test]
fn heading_follows_rotation() {
    let (w, h) = (96, 96);
    let step = 0.15f32;
    let mut t = tracker();
    t.next_frame(render_target(w, h, 48.0, 48.0, 0.0)).unwrap();
    t.activate(Point2::new(48.0, 48.0), 0).unwrap();

    let mut last = t.heading();
    for i in 1..=6u64 {
        t.next_frame(render_target(w, h, 48.0, 48.0, step * i as f32)).unwrap();
        assert!(t.track(i * 40, true).unwrap(), "frame {i}");
        let turn = wrap_angle(t.heading() - last);
        assert!((turn - step).abs() < 0.08, "frame {i}: turned {turn}");
        assert!((t.position() - Point2::new(48.0, 48.0)).norm() < 0.5);
        last = t.heading();
    }
}

#[test]
fn activation_settles_the_heading() {
    let mut t = tracker();
    t.next_frame(render_target(96, 96, 48.0, 48.0, 0.7)).unwrap();
    let centre = Point2::new(48.0, 48.0);
    let axis = t.compute_heading(&centre).unwrap();
    t.activate(centre, 0).unwrap();

    // the unrotated template wins over its half turn
    assert!(wrap_angle(t.heading() - axis).abs() < 1e-6);
    assert!(t.error() > 0.99, "ncc {}", t.error());
    assert_eq!(t.history().entries()[0].orientation_rad, t.heading());
}

#[test]
fn half_turn_is_held_back_by_flip_correction() {
    let (w, h) = (96, 96);
    let centre = Point2::new(48.0, 48.0);
    let start = || {
        let mut t = tracker();
        t.next_frame(render_target(w, h, centre.x, centre.y, 0.0)).unwrap();
        t.activate(centre, 0).unwrap();
        t.next_frame(render_target(w, h, centre.x, centre.y, std::f32::consts::PI)).unwrap();
        t
    };

    let mut free = start();
    let before = free.heading();
    assert!(free.track(40, false).unwrap());
    assert!(free.error() > 0.9, "ncc {}", free.error());
    let jump = wrap_angle(free.heading() - before).abs();
    assert!(jump > free.params().flip_threshold, "jumped {jump}");

    let mut corrected = start();
    let before = corrected.heading();
    let accepted = corrected.track(40, true).unwrap();
    let jump = wrap_angle(corrected.heading() - before).abs();
    assert!(jump <= corrected.params().flip_threshold, "jumped {jump}");
    // the kept orientation no longer matches the frame
    assert!(!accepted);
    assert_eq!(corrected.status(), TrackStatus::JustLost);
}

#[test]
fn history_exports_to_log_and_csv() {
    let frame = render_target(80, 80, 40.0, 40.0, 0.0);
    let mut t = tracker();
    t.next_frame(frame.clone()).unwrap();
    t.activate(Point2::new(40.0, 40.0), 1000).unwrap();
    for i in 1..=2u64 {
        t.next_frame(frame.clone()).unwrap();
        assert!(t.track(1000 + i * 500, true).unwrap());
    }
    assert_eq!(t.history_mut().interpolate(200), 4);

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("track.log");
    let csv = dir.path().join("track.csv");
    save_log(&log, t.history(), 2.0).unwrap();
    save_csv(&csv, t.history(), 2.0).unwrap();

    let text = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 8);
    assert!(lines[1].starts_with("  1.000  20.00 -20.00 "));
    assert!(lines[1].ends_with(" -1.0000"), "{}", lines[1]);
    assert_eq!(lines.iter().filter(|l| l.ends_with("interpolated")).count(), 4);

    let text = std::fs::read_to_string(&csv).unwrap();
    assert_eq!(text.lines().count(), 8);
    assert!(text.starts_with("Time(s),X(cm),Y(cm),H(deg),Err,WGM\n"));
    assert!(text.lines().skip(1).all(|l| l.split(',').count() == 6));
    assert_eq!(UNKNOWN_WGM, -1.0);
}
