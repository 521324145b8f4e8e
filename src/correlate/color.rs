//! Packed event colors.
//!
//! Colors are `0xAABBGGRR`, the layout immediate-mode renderers consume
//! directly. Auto colors come from a hash of an identity string mapped to a
//! hue; events carrying [`EventFlags::AUTOGEN_COLOR`] are the only ones a
//! recolor pass may touch.

use super::TraceIndices;
use crate::event::{EventFlags, TraceEvent};
use crate::hash::fnv1a32;

pub fn pack_rgba(r: u8, g: u8, b: u8, a: u8) -> u32 {
    (a as u32) << 24 | (b as u32) << 16 | (g as u32) << 8 | r as u32
}

pub fn unpack_rgba(color: u32) -> (u8, u8, u8, u8) {
    (color as u8, (color >> 8) as u8, (color >> 16) as u8, (color >> 24) as u8)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    if s <= 0.0 {
        return (v, v, v);
    }
    let h = (h.fract() + 1.0).fract() * 6.0;
    let i = h.floor();
    let f = h - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match i as u32 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

/// Maps a hash to a color: low 24 bits pick the hue, the top byte the value.
pub fn color_from_hash(hash: u32, saturation: f32, alpha: f32) -> u32 {
    let h = (hash & 0x00ff_ffff) as f32 / 16_777_215.0;
    let v = (hash >> 24) as f32 / (2.0 * 255.0) + 0.5;
    let (r, g, b) = hsv_to_rgb(h, saturation.clamp(0.0, 1.0), v);
    let to_u8 = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    pack_rgba(to_u8(r), to_u8(g), to_u8(b), to_u8(alpha))
}

pub fn color_from_name(name: &str, saturation: f32, alpha: f32) -> u32 {
    color_from_hash(fnv1a32(name), saturation, alpha)
}

/// Parses `#rrggbb` or `#rrggbbaa`.
pub fn parse_hex_color(hex: &str) -> Option<u32> {
    let hex = hex.trim().trim_start_matches('#');
    let byte = |i: usize| hex.get(i..i + 2).and_then(|s| u8::from_str_radix(s, 16).ok());
    match hex.len() {
        6 => Some(pack_rgba(byte(0)?, byte(2)?, byte(4)?, 0xff)),
        8 => Some(pack_rgba(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
        _ => None,
    }
}

pub fn color_to_hex(color: u32) -> String {
    let (r, g, b, a) = unpack_rgba(color);
    format!("#{:02x}{:02x}{:02x}{:02x}", r, g, b, a)
}

/// Colors an event from `identity` and marks it auto-colored.
pub fn set_auto_color(event: &mut TraceEvent, identity: &str, saturation: f32, alpha: f32) {
    event.color = Some(color_from_name(identity, saturation, alpha));
    event.flags.insert(EventFlags::AUTOGEN_COLOR);
}

/// Applies a user color to every event named `name` that is not
/// auto-colored. Returns how many events changed.
pub fn set_event_color(events: &mut [TraceEvent], indices: &TraceIndices, name: &str, color: u32) -> usize {
    let Some(ids) = indices.by_name.get(name) else {
        return 0;
    };
    let mut changed = 0;
    for &id in ids {
        let event = &mut events[id as usize];
        if !event.flags.contains(EventFlags::AUTOGEN_COLOR) {
            event.color = Some(color);
            changed += 1;
        }
    }
    changed
}

/// Recomputes auto colors from new label settings. User colors are left alone.
pub fn recolor_auto(events: &mut [TraceEvent], saturation: f32, alpha: f32) -> usize {
    let mut changed = 0;
    for event in events.iter_mut().filter(|e| e.flags.contains(EventFlags::AUTOGEN_COLOR)) {
        event.color = Some(color_from_name(&event.user_comm, saturation, alpha));
        changed += 1;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn event(name: &str, comm: &str) -> TraceEvent {
        TraceEvent::new(0, 0, 1, Arc::from(comm), Arc::from("sys"), Arc::from(name), Vec::new())
    }

    #[test]
    fn test_hash_colors_are_stable_and_opaque() {
        let a = color_from_name("glxgears-1234", 0.9, 1.0);
        assert_eq!(a, color_from_name("glxgears-1234", 0.9, 1.0));
        assert_ne!(a, color_from_name("Xorg-800", 0.9, 1.0));
        assert_eq!(unpack_rgba(a).3, 0xff);
    }

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#ff0000"), Some(pack_rgba(0xff, 0, 0, 0xff)));
        assert_eq!(parse_hex_color("00ff0080"), Some(pack_rgba(0, 0xff, 0, 0x80)));
        assert_eq!(parse_hex_color("#fff"), None);
        assert_eq!(color_to_hex(pack_rgba(1, 2, 3, 4)), "#01020304");
    }

    #[test]
    fn test_user_color_skips_auto_colored_events() {
        let mut events = vec![event("fence_signaled", "a-1"), event("fence_signaled", "b-2")];
        set_auto_color(&mut events[0], "a-1", 0.9, 1.0);
        let auto = events[0].color;

        let mut indices = TraceIndices::default();
        indices.by_name.insert(Arc::from("fence_signaled"), vec![0, 1]);

        assert_eq!(set_event_color(&mut events, &indices, "fence_signaled", 0xff00ff00), 1);
        assert_eq!(events[0].color, auto);
        assert_eq!(events[1].color, Some(0xff00ff00));

        assert_eq!(recolor_auto(&mut events, 0.5, 0.5), 1);
        assert_ne!(events[0].color, auto);
        assert_eq!(events[1].color, Some(0xff00ff00));
    }
}
