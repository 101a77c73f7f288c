mod common;

use common::*;

use cairn::{
    Bounds, CacheConfig, Error, LocalEndpoint, Point, QueryParams, Reader, Structure,
};

use std::sync::Arc;

fn open(ep: Arc<LocalEndpoint>) -> Reader {
    Reader::open(ep, CacheConfig::default()).unwrap()
}

#[test]
fn stacked_duplicates_and_bumping() {
    // Three points, two of them coordinate-equal: the duplicate stacks on
    // the root tube's resident and the farther point bumps one level down.
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = xyz_schema();

    let points = [
        Point::new(0.0, 0.0, 0.0),
        Point::new(1.0, 1.0, 1.0),
        Point::new(0.0, 0.0, 0.0),
    ];
    build(
        ep.clone(),
        config(schema.clone(), small_structure(), CacheConfig::default()),
        &[source("a", &schema, &points)],
    );

    let reader = open(ep);
    assert_eq!(
        reader.count(QueryParams::depth_range(0, 16)).unwrap(),
        3,
        "all three points resolve"
    );

    // Depth 0 holds the duplicate pair; (1, 1, 1) lives at depth 1.
    assert_eq!(reader.count(QueryParams::depth_range(0, 1)).unwrap(), 2);
    let deeper = reader.read(QueryParams::depth_range(1, 2)).unwrap();
    assert_eq!(
        points_of(&reader.metadata().schema, &deeper.data),
        vec![Point::new(1.0, 1.0, 1.0)]
    );
}

#[test]
fn equidistant_points_tie_break_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = xyz_schema();

    // Both at distance 1 from the root mid; the chained order prefers the
    // negative x point for the root tube.
    let points = [Point::new(1.0, 0.0, 0.0), Point::new(-1.0, 0.0, 0.0)];
    build(
        ep.clone(),
        config(schema.clone(), small_structure(), CacheConfig::default()),
        &[source("a", &schema, &points)],
    );

    let reader = open(ep);
    let root = reader.read(QueryParams::depth_range(0, 1)).unwrap();
    assert_eq!(
        points_of(&reader.metadata().schema, &root.data),
        vec![Point::new(-1.0, 0.0, 0.0)]
    );
    let bumped = reader.read(QueryParams::depth_range(1, 2)).unwrap();
    assert_eq!(
        points_of(&reader.metadata().schema, &bumped.data),
        vec![Point::new(1.0, 0.0, 0.0)]
    );
}

#[test]
fn bounded_query_filters_points() {
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = xyz_schema();

    let points = [
        Point::new(0.0, 0.0, 0.0),
        Point::new(1.0, 1.0, 1.0),
        Point::new(0.0, 0.0, 0.0),
        Point::new(-1.0, -1.0, -1.0),
    ];
    build(
        ep.clone(),
        config(schema.clone(), small_structure(), CacheConfig::default()),
        &[source("a", &schema, &points)],
    );

    let reader = open(ep);
    let result = reader
        .read(QueryParams {
            bounds: Some(Bounds::new(Point::splat(0.0), Point::splat(2.0))),
            depth_begin: 0,
            depth_end: 3,
            ..QueryParams::default()
        })
        .unwrap();

    let mut got = points_of(&reader.metadata().schema, &result.data);
    got.sort_by_key(|p| (p.x.to_bits(), p.y.to_bits(), p.z.to_bits()));
    assert_eq!(
        got,
        vec![
            Point::new(0.0, 0.0, 0.0),
            Point::new(0.0, 0.0, 0.0),
            Point::new(1.0, 1.0, 1.0),
        ]
    );
}

#[test]
fn concurrent_disjoint_files_match_sequential_builds() {
    let schema = xyz_schema();
    let file_a: Vec<Point> = (0..40)
        .map(|i| Point::new(-2.0 + (i as f64) * 0.04, -1.0, 0.5))
        .collect();
    let file_b: Vec<Point> = (0..40)
        .map(|i| Point::new(1.9, -2.0 + (i as f64) * 0.09, -0.25))
        .collect();

    let run = |sources: &[cairn::MemorySource]| {
        let dir = tempfile::tempdir().unwrap();
        let ep = Arc::new(LocalEndpoint::new(dir.path()));
        build(
            ep,
            config(schema.clone(), small_structure(), CacheConfig::default()),
            sources,
        );
        let mut files = snapshot(dir.path());
        files.remove("entwine-files.json");
        files
    };

    let parallel = run(&[
        source("a", &schema, &file_a),
        source("b", &schema, &file_b),
    ]);
    let seq_ab = run(&[
        source("a", &schema, &file_a),
        source("b", &schema, &file_b),
    ]);
    let seq_ba = run(&[
        source("b", &schema, &file_b),
        source("a", &schema, &file_a),
    ]);

    assert_eq!(parallel, seq_ab);
    assert_eq!(parallel, seq_ba);
}

#[test]
fn tiny_cache_completes_and_unpins() {
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = xyz_schema();

    // Spread points across many cold chunks.
    let points: Vec<Point> = (0..200)
        .map(|i| {
            let f = i as f64;
            Point::new(
                -2.0 + (f * 0.019),
                2.0 - (f * 0.017),
                -2.0 + ((f * 7.0) % 200.0) * 0.019,
            )
        })
        .collect();

    let tiny = CacheConfig {
        max_resident_chunks: 2,
    };
    let builder = build(
        ep.clone(),
        config(
            schema.clone(),
            Structure {
                base_depth: 2,
                cold_depth: 6,
                chunk_step: 2,
            },
            tiny,
        ),
        &[source("a", &schema, &points)],
    );
    assert_eq!(builder.files().point_stats().inserted, 200);

    let reader = Reader::open(ep, tiny).unwrap();
    let query = reader.query(QueryParams::depth_range(0, 7)).unwrap();
    assert!(query.chunks().len() >= 5, "expected many overlapping chunks");
    let result = query.read().unwrap();
    assert_eq!(result.num_points, 200);

    assert_eq!(reader.cache().total_pins(), 0, "all pins returned");
}

#[test]
fn empty_depth_range_is_rejected_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = xyz_schema();
    build(
        ep.clone(),
        config(schema.clone(), small_structure(), CacheConfig::default()),
        &[source("a", &schema, &[Point::new(0.5, 0.5, 0.5)])],
    );

    let counting = Arc::new(common::CountingEndpoint::new(dir.path()));
    let reader = Reader::open(counting.clone(), CacheConfig::default()).unwrap();
    let before = counting.get_count();

    let err = reader.query(QueryParams::depth_range(3, 3)).unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
    assert_eq!(counting.get_count(), before, "no i/o for a malformed query");
}

#[test]
fn out_of_bounds_points_are_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = xyz_schema();

    let points = [
        Point::new(0.5, 0.5, 0.5),
        Point::new(10.0, 0.0, 0.0),
        Point::new(-0.5, -0.5, -0.5),
    ];
    let builder = build(
        ep.clone(),
        config(schema.clone(), small_structure(), CacheConfig::default()),
        &[source("a", &schema, &points)],
    );

    let stats = builder.files().point_stats();
    assert_eq!(stats.inserted, 2);
    assert_eq!(stats.out_of_bounds, 1);
    assert_eq!(stats.total(), 3);

    let reader = open(ep);
    assert_eq!(reader.count(QueryParams::depth_range(0, 16)).unwrap(), 2);

    // The persisted manifest carries the same counters.
    let manifest = reader.files().expect("manifest saved");
    assert_eq!(manifest.point_stats().out_of_bounds, 1);
    assert_eq!(manifest.get(0).status, cairn::FileStatus::Inserted);
}

#[test]
fn widening_a_query_never_shrinks_results() {
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = xyz_schema();

    let points: Vec<Point> = (0..60)
        .map(|i| {
            let f = i as f64;
            Point::new((f * 0.31) % 3.8 - 1.9, (f * 0.17) % 3.8 - 1.9, (f * 0.73) % 3.8 - 1.9)
        })
        .collect();
    build(
        ep.clone(),
        config(schema.clone(), small_structure(), CacheConfig::default()),
        &[source("a", &schema, &points)],
    );
    let reader = open(ep);

    let narrow = |b: f64, d: u64| QueryParams {
        bounds: Some(Bounds::new(Point::splat(-b), Point::splat(b))),
        depth_begin: 0,
        depth_end: d,
        ..QueryParams::default()
    };

    let mut last = 0;
    for (half, depth) in [(0.5, 1), (1.0, 2), (1.5, 3), (2.0, 5)] {
        let n = reader.count(narrow(half, depth)).unwrap();
        assert!(n >= last, "query widened but count dropped: {n} < {last}");
        last = n;
    }
    assert_eq!(last, 60);
}

#[test]
fn filters_and_schema_projection() {
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = intensity_schema();

    let sources = [cairn::MemorySource {
        path: "a".to_string(),
        points: (0..20)
            .map(|i| {
                let f = i as f64;
                record_with_intensity(
                    &schema,
                    Point::new((f * 0.39) % 3.8 - 1.9, (f * 0.57) % 3.8 - 1.9, (f * 0.91) % 3.8 - 1.9),
                    (i * 50) as u16,
                )
            })
            .collect(),
    }];
    build(
        ep.clone(),
        config(schema.clone(), small_structure(), CacheConfig::default()),
        &sources,
    );
    let reader = open(ep);

    // Intensity >= 500 keeps i in 10..20.
    let filter = cairn::Filter {
        conditions: vec![cairn::Condition {
            dim: "Intensity".to_string(),
            op: cairn::Comparison::Ge,
            value: 500.0,
        }],
    };
    let filtered = reader
        .count(QueryParams {
            filter: Some(filter.clone()),
            ..QueryParams::depth_range(0, 16)
        })
        .unwrap();
    assert_eq!(filtered, 10);

    // Project into a narrower schema with a converted intensity type.
    let out_schema = cairn::Schema::new([
        cairn::DimSpec {
            name: "Intensity".to_string(),
            dim_type: cairn::DimType::F32,
        },
        cairn::DimSpec {
            name: "X".to_string(),
            dim_type: cairn::DimType::F64,
        },
    ]);
    let result = reader
        .read(QueryParams {
            schema: Some(out_schema.clone()),
            filter: Some(filter),
            ..QueryParams::depth_range(0, 16)
        })
        .unwrap();
    assert_eq!(result.num_points, 10);
    assert_eq!(result.data.len() as u64, 10 * out_schema.point_size() as u64);

    let int_dim = out_schema.find("Intensity").unwrap();
    for rec in result.data.chunks(out_schema.point_size()) {
        assert!(int_dim.get(rec) >= 500.0);
    }

    // Filtering on a dimension the schema does not have is a query error.
    let err = reader
        .count(QueryParams {
            filter: Some(cairn::Filter {
                conditions: vec![cairn::Condition {
                    dim: "Nope".to_string(),
                    op: cairn::Comparison::Eq,
                    value: 0.0,
                }],
            }),
            ..QueryParams::depth_range(0, 16)
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
}

#[test]
fn scaled_datasets_project_back_to_native_coordinates() {
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = xyz_schema();

    let delta = cairn::Delta::new(Point::splat(0.01), Point::new(100.0, 200.0, 0.0));
    let cfg = cairn::BuildConfig {
        schema: schema.clone(),
        bounds: Bounds::new(Point::new(98.0, 198.0, -2.0), Point::new(102.0, 202.0, 2.0)),
        delta,
        structure: small_structure(),
        reprojection: None,
        data_io: cairn::DataIo::Lz4,
        cache: CacheConfig::default(),
    };

    let native = [
        Point::new(100.5, 200.25, 0.75),
        Point::new(99.25, 199.5, -1.25),
    ];
    build(ep.clone(), cfg, &[source("a", &schema, &native)]);
    let reader = open(ep);

    // Stored coordinates are in tree space.
    let tree = reader.read(QueryParams::depth_range(0, 16)).unwrap();
    let mut got = points_of(&schema, &tree.data);
    got.sort_by_key(|p| p.x.to_bits() as i64);
    assert_eq!(got, vec![Point::new(-75.0, -50.0, -125.0), Point::new(50.0, 25.0, 75.0)]);

    // Requesting an identity output delta recovers native coordinates.
    let result = reader
        .read(QueryParams {
            delta: Some(cairn::Delta::default()),
            bounds: Some(Bounds::new(
                Point::new(100.0, 200.0, 0.0),
                Point::new(101.0, 201.0, 1.0),
            )),
            ..QueryParams::depth_range(0, 16)
        })
        .unwrap();
    assert_eq!(
        points_of(&schema, &result.data),
        vec![Point::new(100.5, 200.25, 0.75)]
    );
}

#[test]
fn reprojection_tag_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let ep = Arc::new(LocalEndpoint::new(dir.path()));
    let schema = xyz_schema();

    let mut cfg = config(schema.clone(), small_structure(), CacheConfig::default());
    cfg.reprojection = Some("EPSG:3857".to_string());
    build(ep.clone(), cfg, &[source("a", &schema, &[Point::ZERO])]);

    let reader = open(ep);
    assert_eq!(reader.metadata().reprojection.as_deref(), Some("EPSG:3857"));
}
