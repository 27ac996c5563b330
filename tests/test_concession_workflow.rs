use chrono::{DateTime, TimeZone, Utc};
use fusao::core::pipeline::merge_sensors;
use fusao::io::metadata_table;
use fusao::types::{
    BandName, BoundingBox, CollectionVersion, CoordinateSystem, GeoTransform, Platform, RawBand,
    RawScene, SceneMetadata, SensorId,
};
use fusao::{
    AreaOfInterest, CompositeStatistic, IndexConfig, InMemoryCatalog, PipelineConfig, RasterProduct,
    SceneCatalog, SceneFilter, ScenePreparer, SpectralIndex, UnmixMode,
};
use ndarray::{array, Array2};
use std::collections::HashMap;

const DIM: (usize, usize) = (3, 3);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 13, 30, 0).unwrap()
}

fn footprint() -> BoundingBox {
    BoundingBox {
        min_lon: -56.8,
        max_lon: -55.0,
        min_lat: -2.5,
        max_lat: -0.8,
    }
}

fn concession() -> BoundingBox {
    BoundingBox {
        min_lon: -56.3,
        max_lon: -56.1,
        min_lat: -1.7,
        max_lat: -1.5,
    }
}

/// Forest reflectance (Blue..SWIR2) over every pixel, with one cloudy pixel
fn raw_scene(sensor: &str, acquired: DateTime<Utc>, cloud_cover: f32, cloudy: (usize, usize)) -> RawScene {
    let forest: [i16; 6] = [300, 600, 350, 3500, 1700, 700];
    let numbers = if sensor.contains("LC08") {
        ["2", "3", "4", "5", "6", "7"]
    } else {
        ["1", "2", "3", "4", "5", "7"]
    };

    let mut bands = HashMap::new();
    for (number, value) in numbers.iter().zip(forest.iter()) {
        bands.insert(
            format!("B{}", number),
            RawBand::Reflectance(Array2::from_elem(DIM, *value)),
        );
    }
    let mut qa = Array2::<u16>::zeros(DIM);
    // Collection 1 cloud bit
    qa[[cloudy.0, cloudy.1]] = 1 << 5;
    bands.insert("pixel_qa".to_string(), RawBand::Bitset(qa));

    RawScene {
        sensor: sensor.to_string(),
        metadata: SceneMetadata {
            id: format!("{}_{}", sensor.replace('/', "_"), acquired.format("%Y%m%d")),
            acquired,
            cloud_cover,
            geometric_rmse: 7.0,
            image_quality: 9,
            footprint: Some(footprint()),
        },
        bands,
    }
}

fn catalog() -> InMemoryCatalog {
    InMemoryCatalog::new(vec![
        raw_scene("LANDSAT/LT05/C01/T1_SR", date(2008, 7, 10), 4.0, (0, 0)),
        raw_scene("LANDSAT/LT05/C01/T1_SR", date(2008, 8, 11), 30.0, (1, 1)),
        raw_scene("LANDSAT/LE07/C01/T1_SR", date(2008, 9, 2), 9.0, (0, 1)),
        raw_scene("LANDSAT/LC08/C01/T1_SR", date(2020, 7, 14), 2.0, (2, 2)),
        raw_scene("LANDSAT/LC08/C01/T1_SR", date(2020, 8, 15), 11.0, (2, 2)),
    ])
}

#[test]
fn test_before_after_ndfi_composites() {
    init_logging();

    let config = PipelineConfig::default().with_index(IndexConfig::new(UnmixMode::Constrained));
    let preparer = ScenePreparer::new(&config).unwrap();
    let engine = config.index_engine().unwrap();
    let compositor = config.compositor().unwrap();
    let catalog = catalog();

    let before_filter = SceneFilter::concession(date(2008, 1, 1), date(2009, 1, 1), concession());
    let after_filter = SceneFilter::concession(date(2020, 1, 1), date(2021, 1, 1), concession());

    let tm = SensorId::new(Platform::Landsat5, CollectionVersion::Collection1);
    let etm = SensorId::new(Platform::Landsat7, CollectionVersion::Collection1);

    let before = merge_sensors(&[
        preparer
            .prepare_collection(&catalog.query_sensor(tm, &before_filter).unwrap(), None)
            .unwrap(),
        preparer
            .prepare_collection(&catalog.query_sensor(etm, &before_filter).unwrap(), None)
            .unwrap(),
    ])
    .unwrap();
    // The 30 % cloud scene is filtered out
    assert_eq!(before.len(), 2);

    let after = preparer
        .prepare_collection(&catalog.query(&after_filter).unwrap(), None)
        .unwrap();
    assert_eq!(after.len(), 2);

    let before_ndfi = before.map_index(&engine, SpectralIndex::Ndfi).unwrap();
    let after_ndfi = after.map_index(&engine, SpectralIndex::Ndfi).unwrap();

    let aoi = AreaOfInterest::new(
        "concession",
        array![[true, true, true], [true, true, true], [true, true, false]],
    );
    let median = compositor.median(&after_ndfi, Some(&aoi)).unwrap();
    // Pixel (2, 2) is cloudy in both 2020 scenes and outside the AOI
    assert_eq!(median.raster.get(2, 2), None);
    assert_eq!(median.observations[[1, 1]], 2);
    for value in median.raster.values().iter().zip(median.raster.validity().iter()).filter(|(_, ok)| **ok) {
        assert!(*value.0 > 0.5, "forest NDFI should be high, got {}", value.0);
    }

    let filled = compositor
        .median_with_fallback(&after_ndfi, &before_ndfi, None)
        .unwrap();
    assert_eq!(filled.statistic, CompositeStatistic::MedianWithMosaicFallback);
    assert!(filled.raster.get(2, 2).is_some());

    let product = RasterProduct::from_composites(
        &[median, filled],
        GeoTransform {
            top_left_x: 600_000.0,
            pixel_width: 30.0,
            rotation_x: 0.0,
            top_left_y: 9_830_000.0,
            rotation_y: 0.0,
            pixel_height: -30.0,
        },
        CoordinateSystem::Projected { epsg: 32721 },
        -9999.0,
    )
    .unwrap();
    assert_eq!(product.bands.len(), 2);
    assert_eq!(product.bands[0].data[[2, 2]], -9999.0);

    let rows = metadata_table(&after);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.sensor == "LC08/C01"));
}

#[test]
fn test_median_reflectance_bands() {
    init_logging();

    let config = PipelineConfig::default();
    let preparer = ScenePreparer::new(&config).unwrap();
    let collection = preparer
        .prepare_collection(&catalog().query(&SceneFilter::default()).unwrap(), None)
        .unwrap();

    let composites = config
        .compositor()
        .unwrap()
        .median_bands(&collection, &[BandName::Red, BandName::Nir], None)
        .unwrap();
    let names: Vec<_> = composites.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Red_median", "NIR_median"]);

    // Three harmonized TM/ETM+ samples and two untouched OLI samples of 350
    let harmonized_red = (350.0f64 * 0.9047 + 61.0).round() as f32;
    let red = &composites[0];
    assert_eq!(red.raster.get(1, 0), Some(harmonized_red));
}
