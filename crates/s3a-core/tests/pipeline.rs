//! End-to-end runs of the default pipelines through `RegionProcessor`.

#![allow(clippy::unwrap_used, clippy::panic)]

use image::{GrayImage, Rgb, RgbImage};
use s3a_core::mask::{self, HistoryValue};
use s3a_core::stages::{CropParams, CropReference, FormatParams};
use s3a_core::{
    AlgorithmCollection, CacheKey, ErrorPolicy, InstanceId, ProcessError, ProcessorCache, RegionProcessor,
    RunInput, XYVertices,
};

fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> XYVertices {
    XYVertices::from_pairs([(x0, y0), (x1, y0), (x1, y1), (x0, y1)])
}

/// Dark background with a bright square at `20..=40` on both axes.
fn bright_square() -> RgbImage {
    RgbImage::from_fn(64, 64, |x, y| {
        if (20..=40).contains(&x) && (20..=40).contains(&y) {
            Rgb([230, 220, 210])
        } else {
            Rgb([20, 25, 30])
        }
    })
}

fn processor(name: &str) -> RegionProcessor {
    let mut collection = AlgorithmCollection::with_defaults();
    collection.set_active(name).unwrap();
    collection.active_processor().unwrap()
}

#[test]
fn basic_shapes_fills_the_drawn_square_and_records_history() {
    let mut p = processor("Basic Shapes");
    let mut cache = ProcessorCache::new();
    let key = CacheKey::Component(InstanceId(3));
    let out = p
        .run(
            RunInput::new(RgbImage::new(40, 30), rect(10.0, 10.0, 19.0, 19.0)),
            key,
            &mut cache,
            ErrorPolicy::Strict,
        )
        .unwrap();

    assert_eq!(mask::count_on(&out.mask), 100);
    assert_eq!(out.diagnostics.summary.result_pixels, 100);

    let history = cache.history(key).unwrap();
    let marked = history
        .pixels()
        .filter(|p| HistoryValue::from_pixel(p.0[0]) == HistoryValue::Foreground)
        .count();
    assert_eq!(marked, 100);
    assert!(cache.history(CacheKey::Unassigned).is_none());
}

#[test]
fn background_only_run_removes_pixels_from_the_old_mask() {
    let mut p = processor("Basic Shapes");
    let mut cache = ProcessorCache::new();
    let key = CacheKey::Component(InstanceId(0));
    let first = p
        .run(
            RunInput::new(RgbImage::new(40, 30), rect(10.0, 10.0, 19.0, 19.0)),
            key,
            &mut cache,
            ErrorPolicy::Strict,
        )
        .unwrap();
    assert_eq!(mask::count_on(&first.mask), 100);

    let second = RunInput {
        background_vertices: rect(10.0, 10.0, 14.0, 19.0),
        old_component_mask: Some(first.mask.clone()),
        ..RunInput::new(RgbImage::new(40, 30), XYVertices::default())
    };
    let out = p.run(second, key, &mut cache, ErrorPolicy::Strict).unwrap();
    assert_eq!(mask::count_on(&out.mask), 50);
    assert_eq!(out.mask.get_pixel(12, 12).0[0], 0);
    assert_ne!(out.mask.get_pixel(17, 12).0[0], 0);
}

#[test]
fn image_reference_crops_to_the_whole_image() {
    let collection = AlgorithmCollection::with_defaults();
    let crop = CropParams {
        reference: CropReference::Image,
        ..CropParams::default()
    };
    let mut p = RegionProcessor::with_framing(collection.active_process().unwrap(), FormatParams::default(), crop);
    let out = p
        .run(
            RunInput::new(RgbImage::new(64, 48), rect(-5.0, -5.0, 80.0, 80.0)),
            CacheKey::Unassigned,
            &mut ProcessorCache::new(),
            ErrorPolicy::Strict,
        )
        .unwrap();
    assert_eq!(out.mask.dimensions(), (64, 48));
    assert_eq!(mask::count_on(&out.mask), 64 * 48);
    let result = out.summaries.iter().find(|s| s.name == "Process Result").unwrap();
    assert_eq!(result.image.dimensions(), (64, 48));
}

#[test]
fn huge_roi_fills_only_the_image() {
    let mut p = processor("Basic Shapes");
    let out = p
        .run(
            RunInput::new(RgbImage::new(20, 20), rect(-1.0e9, -1.0e9, 1.0e9, 1.0e9)),
            CacheKey::Unassigned,
            &mut ProcessorCache::new(),
            ErrorPolicy::Strict,
        )
        .unwrap();
    assert_eq!(out.mask.dimensions(), (20, 20));
    assert_eq!(mask::count_on(&out.mask), 400);
}

#[test]
fn roi_outside_the_image_selects_nothing() {
    let mut p = processor("Basic Shapes");
    for roi in [rect(500.0, 500.0, 600.0, 600.0), rect(-50.0, -50.0, -10.0, -10.0)] {
        let out = p
            .run(
                RunInput::new(RgbImage::new(24, 18), roi),
                CacheKey::Unassigned,
                &mut ProcessorCache::new(),
                ErrorPolicy::Strict,
            )
            .unwrap();
        assert_eq!(out.mask.dimensions(), (24, 18));
        assert_eq!(mask::count_on(&out.mask), 0);
    }
}

#[test]
fn grabcut_separates_the_bright_square() {
    let mut p = processor("Cv Grabcut");
    let out = p
        .run(
            RunInput::new(bright_square(), rect(14.0, 14.0, 46.0, 46.0)),
            CacheKey::Unassigned,
            &mut ProcessorCache::new(),
            ErrorPolicy::Strict,
        )
        .unwrap();
    assert_ne!(out.mask.get_pixel(30, 30).0[0], 0);
    assert_eq!(out.mask.get_pixel(16, 16).0[0], 0);
    assert_eq!(out.mask.get_pixel(5, 5).0[0], 0);
}

#[test]
fn region_grow_follows_the_uniform_area() {
    let mut p = processor("Region Grow");
    let seed = rect(28.0, 28.0, 32.0, 32.0);
    let out = p
        .run(
            RunInput::new(bright_square(), seed),
            CacheKey::Unassigned,
            &mut ProcessorCache::new(),
            ErrorPolicy::Strict,
        )
        .unwrap();
    assert_ne!(out.mask.get_pixel(22, 38).0[0], 0);
    assert_eq!(out.mask.get_pixel(10, 10).0[0], 0);
    assert_eq!(out.mask.get_pixel(45, 30).0[0], 0);
}

#[test]
fn k_means_runs_are_deterministic() {
    let input = RunInput::new(bright_square(), rect(25.0, 25.0, 35.0, 35.0));
    let run = |p: &mut RegionProcessor, cache: &mut ProcessorCache| {
        p.run(input.clone(), CacheKey::Unassigned, cache, ErrorPolicy::Strict)
            .unwrap()
            .mask
    };

    let mut first = processor("K Means");
    let mut cache = ProcessorCache::new();
    let a = run(&mut first, &mut cache);
    let b = run(&mut processor("K Means"), &mut ProcessorCache::new());
    assert_eq!(a, b);

    cache.clear(CacheKey::Unassigned);
    first.reset_state();
    assert_eq!(run(&mut first, &mut cache), a);
    assert!(mask::count_on(&a) > 0);
}

#[test]
fn recover_and_strict_policies_differ_on_stage_failure() {
    let mut collection = AlgorithmCollection::with_defaults();
    collection.set_active("K Means").unwrap();
    let mut p = collection.active_processor().unwrap();
    // Without the clustering stage, binarization has no labels to read.
    p.process_mut().set_stage_enabled(&["K Means Segmentation"], false).unwrap();

    let mut old = GrayImage::new(64, 64);
    old.put_pixel(1, 1, image::Luma([255]));
    let input = RunInput {
        old_component_mask: Some(old.clone()),
        ..RunInput::new(bright_square(), rect(25.0, 25.0, 35.0, 35.0))
    };

    let out = p
        .run(input.clone(), CacheKey::Unassigned, &mut ProcessorCache::new(), ErrorPolicy::Recover)
        .unwrap();
    assert_eq!(out.mask, old);
    assert!(out.recovered.is_some());

    let err = p
        .run(input, CacheKey::Unassigned, &mut ProcessorCache::new(), ErrorPolicy::Strict)
        .unwrap_err();
    assert!(matches!(err, ProcessError::Stage { .. }));
    assert!(!err.is_configuration());
}

#[test]
fn disabled_stages_are_reported_as_skipped() {
    let mut p = processor("Basic Shapes");
    p.process_mut()
        .set_stage_enabled(&["Basic Region Operations", "Opening"], false)
        .unwrap();
    let out = p
        .run(
            RunInput::new(RgbImage::new(30, 30), rect(5.0, 5.0, 14.0, 14.0)),
            CacheKey::Unassigned,
            &mut ProcessorCache::new(),
            ErrorPolicy::Strict,
        )
        .unwrap();
    let skipped: Vec<_> = out.diagnostics.stages.iter().filter(|s| s.skipped).collect();
    assert_eq!(skipped.len(), 1);
    assert!(skipped[0].name.ends_with("Opening"));
    assert_eq!(mask::count_on(&out.mask), 100);
}
