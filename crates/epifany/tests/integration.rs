use epifany_core::id::{
    ConsensusFeature, ConsensusMap, PeptideHit, PeptideIdentification, ProteinHit,
    ProteinIdentification, POSTERIOR_ERROR_PROBABILITY,
};
use epifany_core::inference::BayesianProteinInference;
use epifany_core::params::{Builder, ParameterTriple};

fn protein(accession: &str, decoy: bool) -> ProteinHit {
    ProteinHit {
        accession: accession.into(),
        score: 0.0,
        decoy,
        prior: None,
    }
}

fn spectrum(sequence: &str, pep: f64, accessions: &[&str]) -> PeptideIdentification {
    PeptideIdentification {
        identifier: "search".into(),
        score_type: POSTERIOR_ERROR_PROBABILITY.into(),
        higher_score_better: false,
        map_index: None,
        hits: vec![PeptideHit {
            sequence: sequence.into(),
            charge: 2,
            score: pep,
            accessions: accessions.iter().map(|s| s.to_string()).collect(),
        }],
    }
}

fn dataset() -> (ProteinIdentification, Vec<PeptideIdentification>) {
    let run = ProteinIdentification {
        identifier: "search".into(),
        hits: vec![
            protein("sp|Q99536|VAT1_HUMAN", false),
            protein("sp|P02768|ALBU_HUMAN", false),
            protein("sp|P68871|HBB_HUMAN", false),
            protein("rev_sp|Q99536|VAT1_HUMAN", true),
            protein("rev_sp|P02768|ALBU_HUMAN", true),
        ],
        ..Default::default()
    };
    let peptides = vec![
        spectrum("LQSRPAAPPAPGPGQLTLR", 0.001, &["sp|Q99536|VAT1_HUMAN"]),
        spectrum(
            "SGMWQEEVTVPSVQTFLIPEAMTFEEAAALLVNYITAYMVLFDFGNLQPGHSVLVHMAAGGVGMAAVQLCR",
            0.02,
            &["sp|Q99536|VAT1_HUMAN"],
        ),
        spectrum("LVNEVTEFAK", 0.005, &["sp|P02768|ALBU_HUMAN"]),
        spectrum("AEFAEVSK", 0.05, &["sp|P02768|ALBU_HUMAN", "sp|P68871|HBB_HUMAN"]),
        spectrum("VHLTPEEK", 0.4, &["sp|P68871|HBB_HUMAN"]),
        spectrum("KAEVTEFNAK", 0.7, &["rev_sp|P02768|ALBU_HUMAN"]),
        spectrum("RLTLQGPGPAPPAAPRSQL", 0.9, &["rev_sp|Q99536|VAT1_HUMAN"]),
    ];
    (run, peptides)
}

#[test]
fn integration() -> Result<(), Box<dyn std::error::Error>> {
    let parameters = Builder::default().make_parameters()?;
    let engine = BayesianProteinInference::new(parameters)?;

    let (mut run, mut peptides) = dataset();
    let summary = engine.infer(&mut run, &mut peptides)?;
    assert_eq!(summary.failed_components, 0);
    assert_eq!(summary.proteins, 5);
    assert!(summary.grid_evaluations > 1);

    let score = |accession: &str| {
        run.hits
            .iter()
            .find(|hit| hit.accession == accession)
            .map(|hit| hit.score)
            .unwrap_or(f64::NAN)
    };
    assert!(score("sp|Q99536|VAT1_HUMAN") > score("rev_sp|Q99536|VAT1_HUMAN"));
    assert!(score("sp|P02768|ALBU_HUMAN") > score("rev_sp|P02768|ALBU_HUMAN"));

    // every PSM was converted and rescored
    for id in &peptides {
        assert!(epifany_core::id::is_posterior_probability(&id.score_type));
        for hit in &id.hits {
            assert!((0.0..=1.0).contains(&hit.score));
        }
    }

    // the chosen parameters survive a JSON round trip and reproduce the run
    let json = serde_json::to_string(&run)?;
    let restored: ProteinIdentification = serde_json::from_str(&json)?;
    let triple: ParameterTriple = restored
        .inference_parameters
        .ok_or("no inference parameters recorded")?;

    let builder: Builder = serde_json::from_str(&format!(
        r#"{{ "model_parameters": {{ "prot_prior": {}, "pep_emission": {}, "pep_spurious_emission": {} }} }}"#,
        triple.gamma, triple.alpha, triple.beta
    ))?;
    let engine = BayesianProteinInference::new(builder.make_parameters()?)?;
    let (mut rerun, mut rerun_peptides) = dataset();
    let summary = engine.infer(&mut rerun, &mut rerun_peptides)?;
    assert_eq!(summary.inference_runs, 1);
    assert_eq!(rerun.hits, run.hits);
    assert_eq!(rerun.indistinguishable_proteins, run.indistinguishable_proteins);

    Ok(())
}

#[test]
fn consensus_features_keep_their_identifications() -> Result<(), Box<dyn std::error::Error>> {
    let (run, peptides) = dataset();
    let mut map = ConsensusMap {
        protein_ids: vec![run],
        features: peptides
            .chunks(2)
            .map(|chunk| ConsensusFeature {
                peptide_ids: chunk.to_vec(),
            })
            .collect(),
        unassigned_peptide_ids: Vec::new(),
    };
    let sizes = map
        .features
        .iter()
        .map(|f| f.peptide_ids.len())
        .collect::<Vec<_>>();

    let engine = BayesianProteinInference::new(Builder::default().make_parameters()?)?;
    let summaries = engine.infer_consensus(&mut map)?;
    assert_eq!(summaries.len(), 1);
    assert_eq!(
        map.features
            .iter()
            .map(|f| f.peptide_ids.len())
            .collect::<Vec<_>>(),
        sizes
    );
    assert_eq!(map.features[0].peptide_ids[0].hits[0].sequence, "LQSRPAAPPAPGPGQLTLR");
    assert!(map.protein_ids[0].hits.iter().all(|hit| hit.score >= 0.0));
    Ok(())
}
