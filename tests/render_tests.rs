use dashbus::led::color::{self, ColorRamp, AMBER, BLACK, RED, YELLOW};
use dashbus::led::render::*;
use dashbus::led::zone::{Zone, ZoneBands};

fn setup(pattern: Pattern) -> (Renderer, ZoneBands, ColorRamp) {
    let bands = ZoneBands::new(6500, 7200);
    let mut renderer = Renderer::new(DEFAULT_LED_COUNT);
    renderer.set_pattern(pattern);
    (renderer, bands, ColorRamp::for_bands(&bands))
}

fn lit(frame: &LedFrame) -> Vec<usize> {
    frame.iter().enumerate().filter(|(_, c)| **c != BLACK).map(|(i, _)| i).collect()
}

#[test]
fn test_bar_levels_with_partial_boundary() {
    let levels = bar_levels(3.5, 8);
    assert_eq!(levels.as_slice(), &[1.0, 1.0, 1.0, 0.5, 0.0, 0.0, 0.0, 0.0]);

    // a sliver of a LED is still visible
    let levels = bar_levels(3.02, 8);
    assert_eq!(levels[3], MIN_VISIBLE);
    assert_eq!(levels[4], 0.0);

    // whole lengths leave the next LED dark
    let levels = bar_levels(3.0, 8);
    assert_eq!(levels[3], 0.0);

    assert!(bar_levels(0.0, 8).iter().all(|l| *l == 0.0));
    assert!(bar_levels(50.0, 8).iter().all(|l| *l == 1.0));
}

#[test]
fn test_boundary_level_floor() {
    assert_eq!(boundary_level(0.0), 0.0);
    assert_eq!(boundary_level(0.01), MIN_VISIBLE);
    assert_eq!(boundary_level(0.6), 0.6);
    assert_eq!(boundary_level(f32::NAN), 0.0);
}

#[test]
fn test_outside_in_bars_grow_from_both_ends() {
    let (renderer, _, _) = setup(Pattern::OutsideIn);
    let levels = renderer.efficiency_levels(0.25);
    let on: Vec<usize> = levels.iter().enumerate().filter(|(_, l)| **l > 0.0).map(|(i, _)| i).collect();
    assert_eq!(on, vec![0, 1, 14, 15]);
}

#[test]
fn test_inside_out_bars_grow_from_the_center() {
    let (renderer, _, _) = setup(Pattern::InsideOut);
    let levels = renderer.efficiency_levels(0.25);
    let on: Vec<usize> = levels.iter().enumerate().filter(|(_, l)| **l > 0.0).map(|(i, _)| i).collect();
    assert_eq!(on, vec![6, 7, 8, 9]);
}

#[test]
fn test_left_to_right_uses_whole_strip() {
    let (renderer, _, _) = setup(Pattern::LeftToRight);
    let levels = renderer.efficiency_levels(0.25);
    let on: Vec<usize> = levels.iter().enumerate().filter(|(_, l)| **l > 0.0).map(|(i, _)| i).collect();
    assert_eq!(on, vec![0, 1, 2, 3]);
}

#[test]
fn test_efficiency_frame_uses_ramp_color() {
    let (mut renderer, bands, ramp) = setup(Pattern::OutsideIn);
    // halfway through the band: yellow, four LEDs per side
    let frame = renderer.render(Zone::EfficiencyBar, 4000.0, &bands, &ramp, 0);

    assert_eq!(frame.len(), DEFAULT_LED_COUNT);
    assert_eq!(lit(&frame), vec![0, 1, 2, 3, 12, 13, 14, 15]);
    assert_eq!(frame[0], YELLOW);
}

#[test]
fn test_off_zone_is_dark() {
    let (mut renderer, bands, ramp) = setup(Pattern::OutsideIn);
    let frame = renderer.render(Zone::Off, 200.0, &bands, &ramp, 0);
    assert!(lit(&frame).is_empty());
}

#[test]
fn test_stall_warning_pulses_at_quarter_points() {
    let (mut renderer, bands, ramp) = setup(Pattern::OutsideIn);

    let frame = renderer.render(Zone::StallWarning, 1000.0, &bands, &ramp, STALL_PULSE_PERIOD_MS / 2);
    assert_eq!(lit(&frame), vec![4, 11]);
    assert_eq!(frame[4], AMBER);

    let frame = renderer.render(Zone::StallWarning, 1000.0, &bands, &ramp, STALL_PULSE_PERIOD_MS);
    assert!(lit(&frame).is_empty());
}

#[test]
fn test_shift_marker_sweeps_faster_near_the_limit() {
    let (mut slow, bands, ramp) = setup(Pattern::LeftToRight);
    let (mut fast, _, _) = setup(Pattern::LeftToRight);

    let frame = slow.render(Zone::ShiftWarning, 6500.0, &bands, &ramp, 0);
    assert_eq!(frame[0], RED);
    assert_eq!(frame[1], color::scale(RED, 0.15));
    fast.render(Zone::ShiftWarning, 7200.0, &bands, &ramp, 0);

    slow.render(Zone::ShiftWarning, 6500.0, &bands, &ramp, 100);
    fast.render(Zone::ShiftWarning, 7200.0, &bands, &ramp, 100);
    assert!(fast.sweep_phase() > slow.sweep_phase());
    assert!(slow.sweep_phase() > 0.0);

    // leaving the shift zone restarts the sweep
    slow.render(Zone::EfficiencyBar, 5000.0, &bands, &ramp, 200);
    assert_eq!(slow.sweep_phase(), 0.0);
}

#[test]
fn test_shift_marker_wraps_around() {
    let (mut renderer, bands, ramp) = setup(Pattern::LeftToRight);
    let mut now = 0;
    for _ in 0..200 {
        let frame = renderer.render(Zone::ShiftWarning, 7200.0, &bands, &ramp, now);
        assert_eq!(frame.iter().filter(|c| **c == RED).count(), 1);
        assert!(renderer.sweep_phase() < DEFAULT_LED_COUNT as f32);
        now += 5;
    }
}

#[test]
fn test_fault_blink_stays_visible_at_zero_brightness() {
    let (mut renderer, _, _) = setup(Pattern::OutsideIn);
    renderer.set_brightness(0);

    let frame = renderer.render_fault(0);
    assert_eq!(lit(&frame), vec![0, DEFAULT_LED_COUNT - 1]);

    let frame = renderer.render_fault(FAULT_BLINK_PERIOD_MS / 2);
    assert!(lit(&frame).is_empty());
}

#[test]
fn test_brightness_scales_every_led() {
    let (mut renderer, bands, ramp) = setup(Pattern::LeftToRight);
    renderer.set_brightness(50);
    let frame = renderer.render(Zone::EfficiencyBar, 6400.0, &bands, &ramp, 0);
    let full = ramp.color_at(6400.0);
    assert_eq!(frame[0], color::scale(full, 0.5));

    renderer.set_brightness(0);
    let frame = renderer.render(Zone::EfficiencyBar, 6400.0, &bands, &ramp, 5);
    assert!(lit(&frame).is_empty());
}

#[test]
fn test_led_count_is_clamped() {
    assert_eq!(Renderer::new(0).led_count(), 1);
    assert_eq!(Renderer::new(100).led_count(), MAX_LEDS);
    assert_eq!(Pattern::from_id(3), None);
    assert_eq!(Pattern::from_id(Pattern::InsideOut.id()), Some(Pattern::InsideOut));
}
