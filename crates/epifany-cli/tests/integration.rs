use epifany_cli::input::{Identifications, Input};
use epifany_cli::runner::Runner;
use epifany_core::id::{
    PeptideHit, PeptideIdentification, ProteinHit, ProteinIdentification, POSTERIOR_PROBABILITY,
    SEARCH_ENGINE,
};

fn identifications() -> Identifications {
    let hit = |accession: &str, decoy| ProteinHit {
        accession: accession.into(),
        score: 0.0,
        decoy,
        prior: None,
    };
    let psm = |sequence: &str, score, accessions: &[&str]| PeptideIdentification {
        identifier: "run".into(),
        score_type: POSTERIOR_PROBABILITY.into(),
        higher_score_better: true,
        map_index: None,
        hits: vec![PeptideHit {
            sequence: sequence.into(),
            charge: 2,
            score,
            accessions: accessions.iter().map(|s| s.to_string()).collect(),
        }],
    };
    Identifications::Runs {
        protein_ids: vec![ProteinIdentification {
            identifier: "run".into(),
            hits: vec![hit("A", false), hit("B", false), hit("C", false), hit("DECOY_A", true)],
            ..Default::default()
        }],
        peptide_ids: vec![
            psm("PEPTIDE", 0.95, &["A", "B"]),
            psm("PEPTIDER", 0.9, &["A", "B"]),
            psm("ELVISLIVESK", 0.8, &["C"]),
            psm("EDITPEP", 0.2, &["DECOY_A"]),
        ],
    }
}

#[test]
fn integration() -> anyhow::Result<()> {
    let dir = std::env::temp_dir().join(format!("epifany-integration-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let ids = dir.join("ids.json");
    std::fs::write(&ids, serde_json::to_vec(&identifications())?)?;

    let input: Input = serde_json::from_value(serde_json::json!({
        "input_path": ids.display().to_string(),
        "output_directory": dir.join("out").display().to_string(),
        "model_parameters": {
            "prot_prior": 0.5,
            "pep_emission": 0.5,
            "pep_spurious_emission": 0.1
        }
    }))?;
    let runner = Runner::new(input.build()?)?;
    let summaries = runner.run()?;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].failed_components, 0);

    let tsv = std::fs::read_to_string(dir.join("out").join("proteins.epifany.tsv"))?;
    let mut lines = tsv.lines();
    assert_eq!(lines.next(), Some("run\taccession\tposterior\tdecoy\tgroup"));
    let rows = lines
        .map(|line| line.split('\t').map(String::from).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3][1], "DECOY_A");
    assert_eq!(rows[3][3], "1");
    // A and B are indistinguishable
    let group = |acc: &str| rows.iter().find(|row| row[1] == acc).map(|row| row[4].clone());
    assert_eq!(group("A"), group("B"));
    assert_ne!(group("A"), group("C"));

    let results: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(
        dir.join("out").join("results.epifany.json"),
    )?)?;
    let run = &results["identifications"]["protein_ids"][0];
    assert_eq!(run["search_engine"], SEARCH_ENGINE);
    assert_eq!(run["inference_parameters"]["alpha"], 0.5);
    assert_eq!(results["summaries"][0]["inference_runs"], 1);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
