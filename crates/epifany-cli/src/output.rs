use super::runner::Runner;
use epifany_core::id::ProteinIdentification;
use fnv::FnvHashMap;

impl Runner {
    pub fn serialize_protein(
        &self,
        run: &ProteinIdentification,
        ix: usize,
        groups: &FnvHashMap<&str, usize>,
    ) -> csv::ByteRecord {
        let hit = &run.hits[ix];
        let mut record = csv::ByteRecord::new();
        record.push_field(run.identifier.as_bytes());
        record.push_field(hit.accession.as_bytes());
        record.push_field(ryu::Buffer::new().format(hit.score).as_bytes());
        record.push_field(itoa::Buffer::new().format(hit.decoy as u8).as_bytes());
        match groups.get(hit.accession.as_str()) {
            Some(group) => record.push_field(itoa::Buffer::new().format(*group).as_bytes()),
            None => record.push_field(b""),
        }
        record
    }

    /// Write one row per protein, best first within each run
    pub fn write_proteins(&self, runs: &[ProteinIdentification]) -> anyhow::Result<String> {
        let path = self.make_path("proteins.epifany.tsv");

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);

        let headers =
            csv::ByteRecord::from(vec!["run", "accession", "posterior", "decoy", "group"]);
        wtr.write_byte_record(&headers)?;

        for run in runs {
            let groups = run
                .indistinguishable_proteins
                .iter()
                .enumerate()
                .flat_map(|(ix, group)| group.accessions.iter().map(move |acc| (acc.as_str(), ix)))
                .collect::<FnvHashMap<_, _>>();

            let mut order = (0..run.hits.len()).collect::<Vec<_>>();
            order.sort_by(|&a, &b| {
                run.hits[b]
                    .score
                    .total_cmp(&run.hits[a].score)
                    .then_with(|| run.hits[a].accession.cmp(&run.hits[b].accession))
            });
            for ix in order {
                wtr.write_byte_record(&self.serialize_protein(run, ix, &groups))?;
            }
        }

        wtr.flush()?;
        let bytes = wtr.into_inner()?;
        std::fs::write(&path, bytes)?;
        Ok(path.display().to_string())
    }
}
