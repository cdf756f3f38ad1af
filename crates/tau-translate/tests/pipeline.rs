use std::path::PathBuf;

use tau_core::{Context, Error};
use tau_hist::{ColumnTable, DirectorySource, ShapeFile};
use tau_translate::templates::parse_tes_value;
use tau_translate::{AnalysisSetup, Datacard, DatacardBuilder, EffectValue, TemplateBuilder, check_shapes};

fn workdir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tau_translate_{name}_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn setup_yaml() -> String {
    let grid: Vec<String> = (0..=60).map(|i| format!("{:.3}", 0.94 + 0.002 * i as f64)).collect();
    format!(
        r#"
channel: mt
tag: _it
baselineCuts: "q_1*q_2<0 && m_2>0.6"
samples:
  weight: "genweight"
  list:
    - {{name: Data, inputs: [SingleMuon], data: true}}
    - {{name: DY, inputs: [DYJets], xsec: 6000.0, sumw: 1.0e8}}
    - {{name: TT, inputs: [TTbar]}}
  split:
    DY:
      - {{name: ZTT, cut: "genmatch_2==5"}}
      - {{name: ZL, cut: "genmatch_2<5"}}
processes: [ZTT, ZL, TT, data_obs]
regions:
  DM0: {{definition: "dm_2==0"}}
  DM1: {{definition: "dm_2==1"}}
observables:
  m_2:
    binning: [10, 0.0, 2.0]
TESvariations:
  processes: [ZTT]
  values: [{}]
  mode: scale
  branches: [m_2]
systematics:
  xsec_dy: {{effect: lnN, processes: [ZTT, ZL], scaleFactor: 1.02}}
  lumi: {{effect: lnN, processes: [ZTT, ZL, TT], scaleFactor: 1.025}}
"#,
        grid.join(", ")
    )
}

fn write_inputs(dir: &std::path::Path) {
    let n = 20_000;
    let m2: Vec<f64> = (0..n).map(|i| 0.2 + 1.6 * ((i * 7919) % n) as f64 / n as f64).collect();
    let make = |name: &str, genmatch: &dyn Fn(usize) -> f64| {
        ColumnTable::from_columns(
            name,
            vec![
                ("m_2".to_string(), m2.clone()),
                ("q_1".to_string(), vec![1.0; n]),
                ("q_2".to_string(), vec![-1.0; n]),
                ("dm_2".to_string(), (0..n).map(|i| (i % 2) as f64).collect()),
                ("genmatch_2".to_string(), (0..n).map(genmatch).collect()),
                ("genweight".to_string(), vec![1.0; n]),
            ],
        )
        .unwrap()
    };
    make("SingleMuon", &|_| 0.0).write_json(&dir.join("SingleMuon.json")).unwrap();
    make("DYJets", &|i| if i % 3 == 0 { 1.0 } else { 5.0 }).write_json(&dir.join("DYJets.json")).unwrap();
    make("TTbar", &|_| 0.0).write_json(&dir.join("TTbar.json")).unwrap();
}

#[test]
fn energy_scale_grid_templates() {
    let dir = workdir("grid");
    write_inputs(&dir);
    let setup = AnalysisSetup::from_yaml_str(&setup_yaml()).unwrap();
    let ctx = Context::from_era("UL2018", setup.channel().unwrap()).unwrap();
    let source = DirectorySource::new(dir.clone());
    let builder = TemplateBuilder::new(&setup, &ctx, &source).threads(2);
    let file = builder.build("m_2").unwrap();

    let dm0 = file.region("DM0").unwrap();
    let grid: Vec<(f64, f64)> = dm0
        .histograms
        .iter()
        .filter_map(|h| parse_tes_value(&h.name, "ZTT").map(|v| (v, h.integral())))
        .collect();
    assert_eq!(grid.len(), 61);
    assert_eq!(grid.iter().filter(|(v, _)| format!("{v:.3}") == "1.000").count(), 1);
    assert!(dm0.get("ZTT").unwrap().integral() > 0.0);
    assert!(grid.windows(2).all(|w| w[1].1 >= w[0].1));
    assert!(grid[60].1 > grid[0].1);

    let names: Vec<&str> = dm0.names().collect();
    assert_eq!(names[0], "data_obs");
    assert_eq!(names[1], "ZTT");
    assert_eq!(names[2], "ZTT_TES0.940");
    assert_eq!(names[62], "ZTT_TES1.060");
    assert_eq!(&names[63..], ["ZL", "TT"]);

    let path = dir.join(builder.file_name("m_2"));
    assert!(path.ends_with("ztt_mt_m_2.inputs-UL2018-13TeV_it.shapes.json"));
    file.write(&path).unwrap();
    let back = ShapeFile::read(&path).unwrap();
    assert_eq!(back.region("DM1").unwrap().names().count(), file.region("DM1").unwrap().names().count());
    assert!(check_shapes(&back).is_empty());
}

#[test]
fn energy_scale_plan_matches_written_templates() {
    let dir = workdir("plan");
    write_inputs(&dir);
    let setup = AnalysisSetup::from_yaml_str(&setup_yaml()).unwrap();
    let ctx = Context::from_era("UL2018", setup.channel().unwrap()).unwrap();
    let source = DirectorySource::new(dir.clone());
    let builder = TemplateBuilder::new(&setup, &ctx, &source).threads(3);
    let plan = builder.plan("m_2").unwrap();
    assert_eq!(plan.regions.len(), 2);

    let expected: Vec<String> = (0..=60).map(|i| format!("ZTT_TES{:.3}", 0.94 + 0.002 * i as f64)).collect();
    for region in &plan.regions {
        let names = region.template_names();
        let tes: Vec<&String> = names.iter().filter(|n| n.starts_with("ZTT_TES")).collect();
        assert_eq!(tes, expected.iter().collect::<Vec<_>>(), "region {}", region.region);
        // the 1.000 point reuses the nominal fill
        assert_eq!(region.n_fills(), names.len() - 1);
    }

    let file = builder.execute(&plan).unwrap();
    assert!(file.meta.complete);
    for region in &plan.regions {
        let shapes = file.region(&region.region).unwrap();
        let written: Vec<String> = shapes.names().map(str::to_string).collect();
        assert_eq!(written, region.template_names());
        let nominal = shapes.get("ZTT").unwrap();
        assert!(nominal.integral() > 0.0);
        assert_eq!(shapes.get("ZTT_TES1.000").unwrap().content, nominal.content);
        let low = shapes.get("ZTT_TES0.940").unwrap().integral();
        let high = shapes.get("ZTT_TES1.060").unwrap().integral();
        assert!(high > low, "{}: {low} -> {high}", region.region);
    }
}

#[test]
fn combined_card_from_built_templates() {
    let dir = workdir("card");
    write_inputs(&dir);
    let setup = AnalysisSetup::from_yaml_str(&setup_yaml()).unwrap();
    let ctx = Context::from_era("UL2018", setup.channel().unwrap()).unwrap();
    let source = DirectorySource::new(dir.clone());
    let file = TemplateBuilder::new(&setup, &ctx, &source).build("m_2").unwrap();

    let regions: Vec<_> = file.regions.iter().collect();
    let card = DatacardBuilder::new(&setup, "shapes.json").build_combined(&regions).unwrap();
    let xsec: Vec<_> = card.nuisances.iter().filter(|n| n.name == "xsec_dy").collect();
    assert_eq!(xsec.len(), 1);
    assert_eq!(xsec[0].effects.iter().filter(|e| **e == Some(EffectValue::Sym(1.02))).count(), 4);
    assert_eq!(card.rate_params.iter().filter(|r| r.name.starts_with("tes_")).count(), 2);

    let text = card.render();
    let path = dir.join("card.txt");
    std::fs::write(&path, &text).unwrap();
    let reread = Datacard::read(&path).unwrap();
    assert_eq!(reread.render(), text);

    let ctx_missing = Context::from_era("UL2018", setup.channel().unwrap()).unwrap();
    let empty = DirectorySource::new(dir.join("nowhere"));
    let err = TemplateBuilder::new(&setup, &ctx_missing, &empty).build("m_2").unwrap_err();
    assert!(matches!(err, Error::Input { .. }));
}
