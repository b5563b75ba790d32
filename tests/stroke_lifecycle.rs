use std::cell::RefCell;
use std::rc::Rc;

use image::{Rgba, RgbaImage};
use paintfe_canvas::{
    CanvasController, CanvasEvent, CanvasPos, CanvasSettings, PaintTool, Pencil, PixelSurface,
    PointerButton, PointerButtons, RectMarquee, ToolBinding, ToolEmitter,
};

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

fn pos(x: f32, y: f32) -> CanvasPos {
    CanvasPos::new(x, y)
}

fn blank(w: u32, h: u32) -> CanvasController {
    CanvasController::new_blank(w, h, CanvasSettings::default())
}

fn record_events(canvas: &mut CanvasController) -> Rc<RefCell<Vec<CanvasEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    canvas.subscribe(move |e| sink.borrow_mut().push(e.clone()));
    events
}

/// Paints one red pixel under the pointer on every move, never on press.
/// Leaks its emitter so a test can keep using it after detachment.
#[derive(Default)]
struct Stamp {
    binding: Option<ToolBinding>,
    leaked: Rc<RefCell<Option<ToolEmitter>>>,
}

impl PaintTool for Stamp {
    fn name(&self) -> &str {
        "Stamp"
    }

    fn bind(&mut self, binding: ToolBinding) {
        *self.leaked.borrow_mut() = Some(binding.emitter.clone());
        self.binding = Some(binding);
    }

    fn on_press(&mut self, _: &mut PixelSurface, _: CanvasPos, _: PointerButton) {}

    fn on_move(&mut self, surface: &mut PixelSurface, pos: CanvasPos) {
        let Some((x, y)) = pos.to_pixel(surface.width(), surface.height()) else {
            return;
        };
        surface.put_pixel(x, y, RED);
        if let Some(b) = &self.binding {
            b.emitter.painted(b.surface);
        }
    }

    fn on_release(&mut self, _: &mut PixelSurface, _: CanvasPos) {}
}

fn stroke(canvas: &mut CanvasController, from: (f32, f32), to: (f32, f32)) {
    canvas.pointer_press(pos(from.0, from.1), PointerButton::Primary);
    canvas.pointer_move(pos(to.0, to.1), PointerButtons::PRIMARY);
    canvas.pointer_release(pos(to.0, to.1));
}

#[test_log::test]
fn a_gesture_commits_at_most_one_entry_however_often_it_paints() {
    for moves in [0u32, 1, 10] {
        let mut canvas = blank(16, 16);
        canvas.set_tool(Some(Box::new(Stamp::default()))).unwrap();

        canvas.pointer_press(pos(0.0, 0.0), PointerButton::Primary);
        for i in 0..moves {
            canvas.pointer_move(pos(i as f32, 1.0), PointerButtons::PRIMARY);
        }
        assert_eq!(canvas.history().len(), 1, "no commit before release");
        canvas.pointer_release(pos(0.0, 0.0));

        let expected = if moves > 0 { 2 } else { 1 };
        assert_eq!(canvas.history().len(), expected, "{} moves", moves);
        if moves > 0 {
            assert_eq!(canvas.history().current().description(), "Stamp");
        }
    }
}

#[test_log::test]
fn a_preview_only_gesture_leaves_content_and_history_alone() {
    let mut canvas = blank(8, 8);
    canvas.set_tool(Some(Box::new(RectMarquee::new()))).unwrap();
    let events = record_events(&mut canvas);
    let before = canvas.current_image();

    stroke(&mut canvas, (1.0, 1.0), (6.0, 6.0));

    assert_eq!(canvas.history().len(), 1);
    assert!(!canvas.is_undo_available());
    assert_eq!(canvas.current_image(), before);
    assert!(events.borrow().is_empty());
    assert!(canvas.is_overlay_shown());
    assert_ne!(*canvas.displayed_image(), before);
}

#[test]
fn undoing_everything_restores_the_original_and_redo_replays_it() {
    let mut canvas = blank(8, 8);
    canvas.set_tool(Some(Box::new(Pencil::new(RED, WHITE)))).unwrap();
    let original = canvas.current_image();

    for y in 0..5 {
        stroke(&mut canvas, (0.0, y as f32), (7.0, y as f32));
    }
    let finished = canvas.current_image();
    assert_eq!(canvas.history().len(), 6);

    while canvas.undo() {}
    assert_eq!(canvas.history().index(), 0);
    assert_eq!(canvas.current_image(), original);

    while canvas.redo() {}
    assert_eq!(canvas.history().index(), 5);
    assert_eq!(canvas.current_image(), finished);
}

#[test]
fn a_new_stroke_after_undo_discards_the_redo_branch() {
    let mut canvas = blank(8, 8);
    canvas.set_tool(Some(Box::new(Pencil::default()))).unwrap();
    stroke(&mut canvas, (0.0, 0.0), (0.0, 0.0));
    stroke(&mut canvas, (1.0, 0.0), (1.0, 0.0));
    assert!(canvas.undo());
    assert!(canvas.is_redo_available());

    stroke(&mut canvas, (2.0, 0.0), (2.0, 0.0));
    assert_eq!(canvas.history().len(), 3);
    assert!(!canvas.is_redo_available());
    assert!(!canvas.redo());
    assert_eq!(*canvas.current_image().get_pixel(1, 0), WHITE);
}

#[test_log::test]
fn swapping_tools_mid_gesture_abandons_the_commit() {
    let mut canvas = blank(8, 8);
    canvas.set_tool(Some(Box::new(Stamp::default()))).unwrap();

    canvas.pointer_press(pos(0.0, 0.0), PointerButton::Primary);
    canvas.pointer_move(pos(3.0, 3.0), PointerButtons::PRIMARY);
    let previous = canvas.set_tool(Some(Box::new(Pencil::default()))).unwrap();
    assert_eq!(previous.map(|t| t.name().to_string()).as_deref(), Some("Stamp"));

    assert_eq!(*canvas.current_image().get_pixel(3, 3), WHITE);

    canvas.pointer_release(pos(3.0, 3.0));
    assert_eq!(canvas.history().len(), 1);
    assert_eq!(canvas.tool_name(), Some("Pencil"));
    assert_eq!(canvas.current_image(), canvas.history().current().pixels().to_rgba_image());
}

#[test]
fn paint_abandoned_by_a_tool_swap_does_not_leak_into_the_next_commit() {
    let mut canvas = blank(4, 4);
    canvas.set_tool(Some(Box::new(Pencil::default()))).unwrap();
    let events = record_events(&mut canvas);

    canvas.pointer_press(pos(1.0, 1.0), PointerButton::Primary);
    canvas.set_tool(None).unwrap();
    canvas.pointer_release(pos(1.0, 1.0));

    assert_eq!(*canvas.current_image().get_pixel(1, 1), WHITE);
    assert!(!canvas.is_undo_available());
    // press painted, then the rollback
    assert_eq!(events.borrow().len(), 2);

    canvas.set_tool(Some(Box::new(Pencil::default()))).unwrap();
    stroke(&mut canvas, (3.0, 3.0), (3.0, 3.0));
    assert!(canvas.undo());
    assert!(canvas.redo());
    assert_eq!(*canvas.current_image().get_pixel(1, 1), WHITE);
    assert_ne!(*canvas.current_image().get_pixel(3, 3), WHITE);
}

#[test]
fn a_detached_tool_can_no_longer_reach_the_canvas() {
    let mut canvas = blank(4, 4);
    let leaked = Rc::new(RefCell::new(None));
    let stamp = Stamp { leaked: leaked.clone(), ..Default::default() };
    canvas.set_tool(Some(Box::new(stamp))).unwrap();
    let surface = canvas.surface().id();
    canvas.set_tool(None).unwrap();

    let events = record_events(&mut canvas);
    let emitter = leaked.borrow_mut().take().unwrap();
    assert!(!emitter.is_connected());
    assert!(!emitter.painted(surface));
    assert!(!emitter.overlay(RgbaImage::new(4, 4), Default::default()));
    canvas.process_tool_signals();

    assert!(events.borrow().is_empty());
    assert!(!canvas.is_overlay_shown());
}

#[test]
fn presses_outside_the_canvas_paint_nothing() {
    let mut canvas = blank(4, 4);
    canvas.set_tool(Some(Box::new(Pencil::default()))).unwrap();
    let events = record_events(&mut canvas);

    stroke(&mut canvas, (-3.0, 10.0), (-3.0, 10.0));
    assert_eq!(canvas.history().len(), 1);
    assert!(events.borrow().is_empty());
}

#[test]
fn chorded_and_middle_drags_are_not_forwarded() {
    let mut canvas = blank(8, 8);
    canvas.set_tool(Some(Box::new(Stamp::default()))).unwrap();

    canvas.pointer_press(pos(0.0, 0.0), PointerButton::Primary);
    canvas.pointer_move(pos(2.0, 2.0), PointerButtons::MIDDLE);
    let chord = PointerButtons { primary: true, secondary: true, middle: false };
    canvas.pointer_move(pos(3.0, 3.0), chord);
    canvas.pointer_release(pos(3.0, 3.0));

    assert_eq!(canvas.history().len(), 1);
    assert_eq!(*canvas.current_image().get_pixel(2, 2), WHITE);
}

#[test]
fn history_length_is_bounded_by_settings() {
    let settings = CanvasSettings { max_undo_steps: 3, ..Default::default() };
    let mut canvas = CanvasController::new_blank(8, 8, settings);
    canvas.set_tool(Some(Box::new(Pencil::default()))).unwrap();

    for x in 0..6 {
        stroke(&mut canvas, (x as f32, 0.0), (x as f32, 0.0));
    }
    assert_eq!(canvas.history().len(), 3);
    assert_eq!(canvas.history().index(), 2);
    assert!(canvas.undo());
    assert!(canvas.undo());
    assert!(!canvas.undo());
    // Oldest reachable state already has the first three strokes.
    assert_ne!(*canvas.current_image().get_pixel(2, 0), WHITE);
    assert_eq!(*canvas.current_image().get_pixel(4, 0), WHITE);
}

#[test]
fn observers_hear_events_in_the_order_they_happen() {
    let mut canvas = blank(4, 4);
    let first = record_events(&mut canvas);
    let second = record_events(&mut canvas);
    canvas.set_tool(Some(Box::new(Pencil::default()))).unwrap();

    canvas.wheel_zoom(-1.0);
    stroke(&mut canvas, (0.0, 0.0), (0.0, 0.0));
    canvas.undo();

    let expected = vec![
        CanvasEvent::ZoomChanged(1.1),
        CanvasEvent::ContentChanged, // press
        CanvasEvent::ContentChanged, // move
        CanvasEvent::ContentChanged, // release
        CanvasEvent::ContentChanged, // commit
        CanvasEvent::ContentChanged, // undo
    ];
    assert_eq!(*first.borrow(), expected);
    assert_eq!(*second.borrow(), expected);
}
