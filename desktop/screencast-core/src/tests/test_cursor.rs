use crate::config::{CursorMode, StreamConfig};
use crate::error::{CaptureDrop, CaptureOutcome};
use crate::format::PixelFormat;
use crate::meta::CursorRecord;
use crate::pool::{DataTypes, SlotId, StreamBuffer};
use crate::tests::fixture::*;
use smithay::utils::Point;
use std::rc::Rc;
use test_log::test;

fn memfd_output(f: &Fixture, mode: CursorMode) -> (Rc<TestOutput>, TestSession, MockConsumer) {
    let output = TestOutput::new("HEADLESS-1", (320, 240));
    let (mut session, consumer) = f.output_session(
        &output,
        None,
        StreamConfig::default().with_dmabuf(false),
        cursor_settings(mode, (320, 240)),
    );
    negotiate(
        &mut session,
        &consumer,
        PixelFormat::Bgr,
        (320, 240),
        None,
        4,
        DataTypes::memfd_only(),
    );
    (output, session, consumer)
}

fn bgr_at(session: &TestSession, slot: SlotId, x: usize, y: usize) -> [u8; 3] {
    let pool = session.pool().borrow();
    let Some(StreamBuffer::MemFd(memfd)) = pool.get(slot) else {
        panic!("slot {slot} is not a memfd");
    };
    let off = y * memfd.stride() + x * 3;
    let px = &memfd.as_slice()[off..off + 3];
    [px[0], px[1], px[2]]
}

#[test]
fn embedded_cursor_on_gpu_frame() {
    let mut f = Fixture::new();
    let window = TestWindow::new("12", (800, 600), true);
    let (mut session, consumer) = f.window_session(
        &window,
        Some(Rc::new(MemfdDmabufSource::linear())),
        StreamConfig::default(),
        cursor_settings(CursorMode::Embedded, (800, 600)),
    );
    negotiate_dmabuf(&mut session, &consumer, (800, 600), 4);

    let pointer = pointer_at(10.0, 10.0, Some(cursor_image((16, 16), (2, 2))));
    let texture = TestTexture::solid((800, 600), [0, 0, 255, 255]);
    let outcome = session.push_frame(&mut f.backend, &texture, &[rect(0, 0, 800, 600)], &pointer);
    assert!(matches!(outcome, CaptureOutcome::Queued), "{outcome:?}");

    assert_eq!(
        f.backend.last_render(),
        Some(&Op::RenderToDmabuf {
            texture: texture.id,
            cursor: Some(rect(8, 8, 16, 16)),
        })
    );
    // the cursor rect lies inside the frame damage
    assert_eq!(consumer.last_queued().damage(), vec![rect(0, 0, 800, 600)]);
    assert_eq!(f.backend.count(|op| matches!(op, Op::Snapshot { .. })), 1);
    assert_eq!(f.backend.count(|op| matches!(op, Op::ImportCursor { .. })), 1);
}

#[test]
fn cursor_texture_is_imported_once_per_image() {
    let mut f = Fixture::new();
    let window = TestWindow::new("12", (200, 100), true);
    let (mut session, consumer) = f.window_session(
        &window,
        Some(Rc::new(MemfdDmabufSource::linear())),
        StreamConfig::default(),
        cursor_settings(CursorMode::Embedded, (200, 100)),
    );
    negotiate_dmabuf(&mut session, &consumer, (200, 100), 4);

    let image = cursor_image((8, 8), (0, 0));
    let texture = TestTexture::solid((200, 100), [0, 0, 0, 255]);
    for x in [10.0, 20.0, 30.0] {
        let pointer = pointer_at(x, 10.0, Some(image.clone()));
        session.push_frame(&mut f.backend, &texture, &[rect(0, 0, 4, 4)], &pointer);
    }
    assert_eq!(consumer.queued().len(), 3);
    assert_eq!(f.backend.count(|op| matches!(op, Op::ImportCursor { .. })), 1);
}

#[test]
fn cursor_move_repaints_from_base_frame() {
    let mut f = Fixture::new();
    let (_output, mut session, consumer) = memfd_output(&f, CursorMode::Embedded);

    let image = cursor_image((32, 32), (0, 0));
    let texture = TestTexture::solid((320, 240), [10, 20, 30, 255]);
    let outcome = session.push_frame(
        &mut f.backend,
        &texture,
        &[],
        &pointer_at(100.0, 100.0, Some(image.clone())),
    );
    assert!(matches!(outcome, CaptureOutcome::Queued));
    assert_eq!(consumer.last_queued().damage(), vec![rect(100, 100, 32, 32)]);
    assert_eq!(f.backend.last_download(), Some(texture.id));

    let queued = consumer.queued().len();
    let outcome = session.push_cursor(&mut f.backend, &pointer_at(150.0, 110.0, Some(image)));
    assert!(matches!(outcome, Some(CaptureOutcome::Queued)), "{outcome:?}");
    assert_eq!(consumer.queued().len(), queued + 1);

    let last = consumer.last_queued();
    assert_eq!(
        last.damage(),
        vec![rect(100, 100, 32, 32), rect(150, 110, 32, 32)]
    );
    // drawn onto the copy taken before the first cursor was blended in
    assert_eq!(f.backend.last_download(), f.backend.last_snapshot());

    assert_eq!(bgr_at(&session, last.slot, 150, 110), [255, 255, 255]);
    assert_eq!(bgr_at(&session, last.slot, 100, 100), [30, 20, 10]);
}

#[test]
fn cursor_move_without_base_frame_asks_for_repaint() {
    let mut f = Fixture::new();
    let (output, mut session, consumer) = memfd_output(&f, CursorMode::Embedded);
    let repaints = output.repaints.get();

    let pointer = pointer_at(5.0, 5.0, Some(cursor_image((8, 8), (0, 0))));
    let outcome = session.push_cursor(&mut f.backend, &pointer);
    assert!(matches!(
        outcome,
        Some(CaptureOutcome::Dropped(CaptureDrop::NoBaseFrame))
    ));
    assert_eq!(output.repaints.get(), repaints + 1);
    assert!(consumer.queued().is_empty());
}

#[test]
fn unchanged_cursor_is_not_repainted() {
    let mut f = Fixture::new();
    let (_output, mut session, consumer) = memfd_output(&f, CursorMode::Embedded);

    let pointer = pointer_at(40.0, 40.0, Some(cursor_image((8, 8), (0, 0))));
    let texture = TestTexture::solid((320, 240), [0, 0, 0, 255]);
    session.push_frame(&mut f.backend, &texture, &[], &pointer);
    let queued = consumer.queued().len();

    let outcome = session.push_cursor(&mut f.backend, &pointer);
    assert!(matches!(
        outcome,
        Some(CaptureOutcome::Dropped(CaptureDrop::CursorUnchanged))
    ));
    assert_eq!(consumer.queued().len(), queued);
}

#[test]
fn hidden_cursor_ignores_pointer() {
    let mut f = Fixture::new();
    let (_output, mut session, consumer) = memfd_output(&f, CursorMode::Hidden);

    let pointer = pointer_at(40.0, 40.0, Some(cursor_image((8, 8), (0, 0))));
    assert!(session.push_cursor(&mut f.backend, &pointer).is_none());

    let texture = TestTexture::solid((320, 240), [0, 0, 0, 255]);
    session.push_frame(&mut f.backend, &texture, &[rect(0, 0, 8, 8)], &pointer);
    assert_eq!(consumer.last_queued().damage(), vec![rect(0, 0, 8, 8)]);
    assert_eq!(f.backend.count(|op| matches!(op, Op::Snapshot { .. })), 0);
}

#[test]
fn cursor_metadata_updates() {
    let mut f = Fixture::new();
    let (_output, mut session, consumer) = memfd_output(&f, CursorMode::Metadata);
    let image = cursor_image((16, 16), (2, 2));

    let outcome = session.push_cursor(&mut f.backend, &pointer_at(10.0, 10.0, Some(image.clone())));
    assert!(matches!(outcome, Some(CaptureOutcome::Queued)), "{outcome:?}");
    let first = consumer.last_queued();
    assert!(first.is_corrupted());
    assert!(first.damage().is_empty());
    let (record, bitmap) = first.cursor();
    assert_eq!(record.id, 1);
    assert_eq!(record.position, Point::from((10, 10)));
    assert_eq!(record.hotspot, Point::from((2, 2)));
    let bitmap = bitmap.expect("first update carries the bitmap");
    assert_eq!(bitmap.size, (16, 16));

    session.push_cursor(&mut f.backend, &pointer_at(20.0, 20.0, Some(image.clone())));
    let (record, bitmap) = consumer.last_queued().cursor();
    assert_eq!(record.position, Point::from((20, 20)));
    assert!(bitmap.is_none());

    session.push_cursor(&mut f.backend, &pointer_at(400.0, 10.0, Some(image.clone())));
    let (record, bitmap) = consumer.last_queued().cursor();
    assert_eq!(record, CursorRecord::invisible());
    assert!(bitmap.is_none());

    let queued = consumer.queued().len();
    let outcome = session.push_cursor(&mut f.backend, &pointer_at(500.0, 10.0, Some(image)));
    assert!(matches!(
        outcome,
        Some(CaptureOutcome::Dropped(CaptureDrop::CursorUnchanged))
    ));
    assert_eq!(consumer.queued().len(), queued);

    let (seq, _) = consumer.last_queued().header();
    assert_eq!(seq, 3);
}

#[test]
fn cursor_metadata_rides_along_with_frames() {
    let mut f = Fixture::new();
    let (_output, mut session, consumer) = memfd_output(&f, CursorMode::Metadata);
    let image = cursor_image((16, 16), (0, 0));

    let texture = TestTexture::solid((320, 240), [0, 0, 0, 255]);
    let outcome = session.push_frame(
        &mut f.backend,
        &texture,
        &[rect(0, 0, 320, 240)],
        &pointer_at(50.0, 60.0, Some(image)),
    );
    assert!(matches!(outcome, CaptureOutcome::Queued));

    let queued = consumer.last_queued();
    assert!(!queued.is_corrupted());
    let (record, bitmap) = queued.cursor();
    assert_eq!(record.position, Point::from((50, 60)));
    assert!(bitmap.is_some());
    // metadata mode never draws the cursor into pixels
    assert_eq!(bgr_at(&session, queued.slot, 50, 60), [0, 0, 0]);
}

#[test]
fn cursor_metadata_waits_for_streaming() {
    let mut f = Fixture::new();
    let output = TestOutput::new("HEADLESS-1", (320, 240));
    let (mut session, consumer) = f.output_session(
        &output,
        None,
        StreamConfig::default().with_dmabuf(false),
        cursor_settings(CursorMode::Metadata, (320, 240)),
    );

    let pointer = pointer_at(10.0, 10.0, Some(cursor_image((8, 8), (0, 0))));
    let outcome = session.push_cursor(&mut f.backend, &pointer);
    assert!(matches!(
        outcome,
        Some(CaptureOutcome::Dropped(CaptureDrop::StreamNotActive))
    ));
    assert_eq!(consumer.dequeues(), 0);
}

#[test]
fn failed_capture_keeps_old_cursor_rect_damaged() {
    let mut f = Fixture::new();
    let (_output, mut session, consumer) = memfd_output(&f, CursorMode::Embedded);
    let image = cursor_image((32, 32), (0, 0));
    let texture = TestTexture::solid((320, 240), [0, 0, 0, 255]);

    session.push_frame(&mut f.backend, &texture, &[], &pointer_at(100.0, 100.0, Some(image.clone())));
    assert_eq!(consumer.last_queued().damage(), vec![rect(100, 100, 32, 32)]);

    f.backend.failing_draws = 1;
    let outcome = session.push_frame(&mut f.backend, &texture, &[rect(0, 0, 4, 4)], &pointer_at(150.0, 110.0, Some(image.clone())));
    assert!(matches!(outcome, CaptureOutcome::Dropped(CaptureDrop::Render(_))), "{outcome:?}");
    assert!(consumer.last_queued().is_corrupted());

    let outcome = session.push_frame(&mut f.backend, &texture, &[], &pointer_at(200.0, 120.0, Some(image)));
    assert!(matches!(outcome, CaptureOutcome::Queued), "{outcome:?}");
    // the cursor drawn last is still at its first position for the consumer
    assert_eq!(
        consumer.last_queued().damage(),
        vec![rect(0, 0, 4, 4), rect(100, 100, 32, 32), rect(200, 120, 32, 32)]
    );
}

#[test]
fn base_frame_is_copied_only_with_cursor_in_view() {
    let mut f = Fixture::new();
    let (output, mut session, consumer) = memfd_output(&f, CursorMode::Embedded);
    let image = cursor_image((8, 8), (0, 0));
    let texture = TestTexture::solid((320, 240), [0, 0, 0, 255]);
    let snapshots = |f: &Fixture| f.backend.count(|op| matches!(op, Op::Snapshot { .. }));

    let outcome = session.push_frame(&mut f.backend, &texture, &[rect(0, 0, 4, 4)], &pointer_at(400.0, 10.0, Some(image.clone())));
    assert!(matches!(outcome, CaptureOutcome::Queued));
    assert_eq!(snapshots(&f), 0);

    // no copy to repaint from, so the source has to render again
    let repaints = output.repaints.get();
    let outcome = session.push_cursor(&mut f.backend, &pointer_at(10.0, 10.0, Some(image.clone())));
    assert!(matches!(
        outcome,
        Some(CaptureOutcome::Dropped(CaptureDrop::NoBaseFrame))
    ));
    assert_eq!(output.repaints.get(), repaints + 1);

    session.push_frame(&mut f.backend, &texture, &[rect(0, 0, 4, 4)], &pointer_at(10.0, 10.0, Some(image)));
    assert_eq!(snapshots(&f), 1);
    assert_eq!(consumer.queued().len(), 2);
}
