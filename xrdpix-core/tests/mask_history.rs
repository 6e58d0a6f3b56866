use ndarray::Array2;
use xrdpix_core::{Mask, MaskMode, DEFAULT_UNDO_LIMIT};

fn assorted_ops(mask: &mut Mask, k: usize) {
    for i in 0..k {
        let f = i as f64;
        match i % 5 {
            0 => mask.mask_ellipse(10.0 + f, 12.0, 4.0, 2.0),
            1 => mask.mask_rect(2.0 * f, 30.0, 5.0, 3.0),
            2 => mask.mask_polygon(&[(5.0, 5.0), (20.0 + f, 8.0), (9.0, 25.0)]),
            3 => mask.mask_point(40.0, 10.0 + f, 2.5),
            _ => mask.grow(),
        }
    }
}

#[test]
fn test_clear_after_geometry_is_empty() {
    let mut mask = Mask::new(64, 64);
    assorted_ops(&mut mask, 13);
    assert!(!mask.is_empty());
    mask.clear_mask();
    assert!(mask.is_empty());
}

#[test]
fn test_undo_restores_empty_for_up_to_bound() {
    for k in [1, 7, DEFAULT_UNDO_LIMIT] {
        let mut mask = Mask::new(64, 64);
        assorted_ops(&mut mask, k);
        for _ in 0..k {
            assert!(mask.undo());
        }
        assert_eq!(mask.data(), Array2::from_elem((64, 64), false).view(), "k = {}", k);
    }
}

#[test]
fn test_undo_redo_is_identity() {
    let mut mask = Mask::new(64, 64);
    assorted_ops(&mut mask, 9);
    let reference = mask.data().to_owned();
    for k in 1..=9 {
        for _ in 0..k {
            mask.undo();
        }
        for _ in 0..k {
            mask.redo();
        }
        assert_eq!(mask.data(), reference.view());
    }
}

#[test]
fn test_undo_depth_is_bounded() {
    let mut mask = Mask::new(128, 128);
    let mut states = vec![mask.data().to_owned()];
    for i in 0..25 {
        mask.mask_ellipse(5.0 + 4.0 * i as f64, 60.0, 2.0, 3.0);
        states.push(mask.data().to_owned());
    }
    assert_eq!(mask.undo_depth(), DEFAULT_UNDO_LIMIT);

    for _ in 0..20 {
        assert!(mask.undo());
    }
    // The five oldest snapshots fell off the bounded history.
    assert_eq!(mask.data(), states[5].view());
    for _ in 20..25 {
        assert!(!mask.undo());
    }
    assert_eq!(mask.data(), states[5].view());
}

#[test]
fn test_grow_then_shrink_interior_is_identity() {
    let mut mask = Mask::new(50, 50);
    mask.mask_rect(10.0, 12.0, 8.0, 5.0);
    mask.mask_ellipse(30.0, 30.0, 6.0, 4.0);
    let before = mask.data().to_owned();
    mask.grow();
    assert!(mask.count() > before.iter().filter(|&&m| m).count());
    mask.shrink();
    assert_eq!(mask.data(), before.view());
}

#[test]
fn test_unmask_mode_round_trip() {
    let mut mask = Mask::new(32, 32);
    mask.mask_rect(0.0, 0.0, 32.0, 32.0);
    mask.set_mode(MaskMode::Unmask);
    mask.mask_rect(0.0, 0.0, 32.0, 32.0);
    assert!(mask.is_empty());
    mask.invert_mask();
    assert_eq!(mask.count(), 32 * 32);
}
