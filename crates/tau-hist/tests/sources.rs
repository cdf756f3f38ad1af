use std::path::PathBuf;

use approx::assert_relative_eq;
use tau_hist::{
    ColumnTable, DirectorySource, EventSource, HistogramSpec, RegionShapes, ShapeFile, ShapeMeta, fill_histograms,
};

fn workdir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tau_hist_{name}_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

const CSV: &str = "m_vis, q_1, q_2, w
55, 1, -1, 1
65, -1, 1, 2
75, 1, -1, 1
85, 1, -1, 1
95, -1, 1, 1
45, 1, -1, 1
70, 1, 1, 1
";

#[test]
fn csv_and_json_inputs_fill_the_same_shapes() {
    let dir = workdir("inputs");
    std::fs::write(dir.join("DY.csv"), CSV).unwrap();
    let source = DirectorySource::new(&dir);
    assert!(source.exists("DY"));
    assert!(!source.exists("TT"));
    assert!(source.open("TT").is_err());

    let csv_table = source.open("DY").unwrap();
    assert_eq!(csv_table.name(), "DY");
    assert_eq!(csv_table.n_rows(), 7);

    csv_table.write_json(&dir.join("DYcopy.json")).unwrap();
    let json_table = ColumnTable::read_json(&dir.join("DYcopy.json")).unwrap();
    assert_eq!(json_table.column("m_vis"), csv_table.column("m_vis"));

    let edges = vec![50.0, 60.0, 70.0, 80.0, 90.0, 100.0];
    let spec = HistogramSpec::new("ZTT", "m_vis", "q_1*q_2<0", "w", edges).unwrap();
    let filled = fill_histograms(std::slice::from_ref(&spec), &csv_table).unwrap();
    assert_eq!(filled[0].histogram.content, vec![2.0, 2.0, 1.0, 1.0, 1.0]);
    assert_relative_eq!(filled[0].underflow, 1.0);
    assert_relative_eq!(filled[0].overflow, 0.0);
    assert_relative_eq!(filled[0].histogram.integral(), 7.0);

    let again = fill_histograms(&[spec], &json_table).unwrap();
    assert_eq!(again[0].histogram.content, filled[0].histogram.content);

    let mut region = RegionShapes::new("DM0");
    region.put(filled[0].histogram.clone());
    let meta = ShapeMeta { analysis: "ztt".into(), channel: "mt".into(), observable: "m_vis".into(), ..ShapeMeta::default() };
    let mut file = ShapeFile::new(meta);
    file.put_region(region);
    let path = dir.join("shapes.json");
    file.write(&path).unwrap();

    let back = ShapeFile::read(&path).unwrap();
    assert_eq!(back.meta.observable, "m_vis");
    assert_eq!(back.get("DM0", "ZTT").unwrap().content, vec![2.0, 2.0, 1.0, 1.0, 1.0]);
    assert!(back.require_region("DM1").is_err());
}

#[test]
fn ragged_csv_is_rejected() {
    let dir = workdir("ragged");
    std::fs::write(dir.join("bad.csv"), "x, y\n1, 2\n3, oops\n").unwrap();
    assert!(DirectorySource::new(&dir).open("bad").is_err());
}
