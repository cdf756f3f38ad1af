use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use tau_hist::{Hist1D, Hist2D, RegionShapes, ShapeFile, ShapeMeta};
use tau_inference::tree::BEST_FIT_QUANTILE;
use tau_inference::{ResponseTensor, ScanTree, UnfoldingInput};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_taufit"))
}

fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let dir = std::env::temp_dir().join(format!("taufit_cli_{}_{}_{}", std::process::id(), nanos, name));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn assert_success(out: &Output) {
    assert!(
        out.status.success(),
        "command failed\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
}

const EDGES: [f64; 5] = [0.2, 0.6, 1.0, 1.4, 1.8];
const SIGNAL: [f64; 4] = [100.0, 400.0, 300.0, 100.0];
const SLOPE: [f64; 4] = [-3.0, -1.0, 1.0, 3.0];

fn write_card(dir: &Path) -> PathBuf {
    let hist = |name: &str, content: Vec<f64>| Hist1D::from_content(name, EDGES.to_vec(), content, None).unwrap();
    let mut region = RegionShapes::new("DM1");
    region.put(hist("data_obs", vec![300.0, 600.0, 500.0, 300.0]));
    region.put(hist("ZTT", SIGNAL.to_vec()));
    for k in 0..7 {
        let v = 0.97 + 0.01 * k as f64;
        region.put(hist(&format!("ZTT_TES{v:.3}"), (0..4).map(|i| SIGNAL[i] + 1000.0 * (v - 1.0) * SLOPE[i]).collect()));
    }
    region.put(hist("ZL", vec![200.0; 4]));
    let mut file = ShapeFile::new(ShapeMeta::default());
    file.put_region(region);
    file.write(&dir.join("shapes.json")).unwrap();

    let card = "imax 1 number of bins
jmax 1 number of processes minus 1
kmax * number of nuisance parameters
--------------------------------
shapes * * shapes.json $BIN/$PROCESS $BIN/$PROCESS_$SYSTEMATIC
shapes ZTT * shapes.json $BIN/$PROCESS_TES$MASS $BIN/$PROCESS_TES$MASS_$SYSTEMATIC
--------------------------------
bin         DM1
observation 1700
--------------------------------
bin         DM1 DM1
process     ZTT ZL
process     0   1
rate        900 800
--------------------------------
lumi     lnN   1.025 1.025
tes_DM1 rateParam DM1 ZTT 1 [0.97,1.03]
";
    let path = dir.join("card.txt");
    std::fs::write(&path, card).unwrap();
    path
}

#[test]
fn version_prints_crate_version() {
    let out = run(&["version"]);
    assert_success(&out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("taufit "), "unexpected output: {stdout}");
}

#[test]
fn scan_parabola_and_export() {
    let dir = tmp_dir("scan");
    let card = write_card(&dir);
    let outdir = dir.join("output");
    let out = run(&[
        "fit",
        "--card",
        card.to_str().unwrap(),
        "--poi",
        "tes_DM1",
        "--points",
        "21",
        "--range",
        "0.98:1.02",
        "--outdir",
        outdir.to_str().unwrap(),
    ]);
    assert_success(&out);
    let tree = outdir.join("higgsCombine.card.tes_DM1.MultiDimFit.json");
    assert!(tree.exists());

    let table = dir.join("measurement_tes.txt");
    let out = run(&[
        "parabola",
        "--tree",
        tree.to_str().unwrap(),
        "--poi",
        "tes_DM1",
        "--measurements",
        table.to_str().unwrap(),
        "--category",
        "DM1",
        "--outdir",
        dir.join("plots").to_str().unwrap(),
    ]);
    assert_success(&out);
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("tes_DM1 = "));
    assert!(dir.join("plots/parabola_tes_DM1.json").exists());

    let out = run(&[
        "export-corrections",
        "--measurements",
        table.to_str().unwrap(),
        "--wp",
        "Medium",
        "--outdir",
        dir.join("corrections").to_str().unwrap(),
    ]);
    assert_success(&out);
    let text = std::fs::read_to_string(dir.join("corrections/tau_energy_scale_Medium.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["schema_version"], 2);

    let out = run(&["postfit", "--tree", tree.to_str().unwrap(), "--outdir", dir.join("plots").to_str().unwrap()]);
    assert_success(&out);
    assert!(dir.join("plots/corr_tes_DM1.json").exists());
    assert!(dir.join("plots/FitparameterValues__UL2018-13TeV_all.txt").exists());
}

#[test]
fn postfit_single_row_tree_skips_curves() {
    let dir = tmp_dir("single");
    let mut tree = ScanTree::new("tes_DM1", vec!["lumi".into()]);
    tree.push_row(1.002, 0.0, BEST_FIT_QUANTILE, &[0.1]).unwrap();
    let path = dir.join("tree.json");
    tree.write(&path).unwrap();

    let plots = dir.join("plots");
    let out = run(&["postfit", "--tree", path.to_str().unwrap(), "--outdir", plots.to_str().unwrap()]);
    assert_success(&out);
    assert!(plots.join("corr_tes_DM1.json").exists());
    let values = std::fs::read_to_string(plots.join("FitparameterValues__UL2018-13TeV_all.txt")).unwrap();
    assert!(values.starts_with("lumi : 0.1"), "{values}");
    let text = std::fs::read_to_string(plots.join("params_tes_DM1.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["records"].as_array().unwrap().len(), 1);
    assert!(json.get("curves").is_none());
    assert!(json.get("measurement").is_none());
}

#[test]
fn dry_run_writes_nothing() {
    let dir = tmp_dir("dry");
    let card = write_card(&dir);
    let outdir = dir.join("output");
    let out = run(&[
        "-n",
        "fit",
        "--card",
        card.to_str().unwrap(),
        "--poi",
        "tes_DM1",
        "--outdir",
        outdir.to_str().unwrap(),
    ]);
    assert_success(&out);
    assert!(!outdir.exists());
}

#[test]
fn unknown_poi_fails() {
    let dir = tmp_dir("poi");
    let card = write_card(&dir);
    let out = run(&["fit", "--card", card.to_str().unwrap(), "--poi", "tes_DM7", "--outdir", dir.to_str().unwrap()]);
    assert!(!out.status.success());
}

fn write_unfolding_input(dir: &Path) -> PathBuf {
    let edges = vec![0.0, 1.0, 2.0];
    let mut response = ResponseTensor::new(edges.clone(), edges.clone(), edges.clone(), edges.clone()).unwrap();
    let mut observed = Hist2D::new("obs", edges.clone(), edges).unwrap();
    for (x, y) in [(0.5, 0.5), (0.5, 1.5), (1.5, 0.5), (1.5, 1.5)] {
        response.fill((x, y), (x, y), 100.0);
        observed.fill(x, y, 110.0);
    }
    let input = UnfoldingInput { name: "zpt".into(), observed, background: None, sim_reco: None, sim_gen: None, response };
    let path = dir.join("unfold_input.json");
    input.write(&path).unwrap();
    path
}

#[test]
fn unfold_writes_weights() {
    let dir = tmp_dir("unfold");
    let input = write_unfolding_input(&dir);
    let outdir = dir.join("weights");
    let out = run(&["unfold", "--input", input.to_str().unwrap(), "--outdir", outdir.to_str().unwrap()]);
    assert_success(&out);
    assert!(outdir.join("zpt_weights.json").exists());

    let out = run(&["unfold", "--input", input.to_str().unwrap(), "--iterations", "-1"]);
    assert!(!out.status.success());
}
