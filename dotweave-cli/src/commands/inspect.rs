use std::path::Path;

use dotweave::{
    metadata::model::TypeHandle,
    weaver::{is_woven, marker::marker_field, stable_id, GeneratedNames},
};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::load_module,
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
struct WovenEntry {
    declaring_type: String,
    method: String,
    token: String,
    stable_id: Option<String>,
    origin: bool,
    delegate_field: bool,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    assembly: String,
    marker_type: bool,
    methods: Vec<WovenEntry>,
    count: usize,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let module = load_module(path)?;

    let mut methods = Vec::new();
    for id in module.method_ids() {
        let method = module.method(id)?;
        if !is_woven(&module, method) {
            continue;
        }
        let stable = stable_id(&module, method);
        let owner = module.type_def(id.ty)?;
        // A marker without a readable id still counts as woven
        let (origin, delegate_field) = stable.map_or((false, false), |s| {
            let names = GeneratedNames::new(&method.name, s);
            (
                owner.method_index(&names.origin_method).is_some(),
                owner.field_index(&names.delegate_field).is_some(),
            )
        });
        methods.push(WovenEntry {
            declaring_type: module.type_full_name(TypeHandle::Def(id.ty)),
            method: method.name.clone(),
            token: format!("0x{:08x}", method.token.value()),
            stable_id: stable.map(|s| s.to_string()),
            origin,
            delegate_field,
        });
    }

    let output = InspectOutput {
        assembly: module.name.clone(),
        marker_type: marker_field(&module).is_some(),
        count: methods.len(),
        methods,
    };

    print_output(&output, opts, |out| {
        println!("{}: {} woven method(s)", out.assembly, out.count);
        if out.methods.is_empty() {
            return;
        }
        let mut tw = TabWriter::new(&[
            ("Token", Align::Left),
            ("Type", Align::Left),
            ("Method", Align::Left),
            ("Id", Align::Left),
            ("Origin", Align::Left),
            ("Field", Align::Left),
        ])
        .indent("  ");
        let yes_no = |b: bool| if b { "yes" } else { "missing" }.to_string();
        for m in &out.methods {
            tw.row(vec![
                m.token.clone(),
                m.declaring_type.clone(),
                m.method.clone(),
                m.stable_id.clone().unwrap_or_else(|| "?".to_string()),
                yes_no(m.origin),
                yes_no(m.delegate_field),
            ]);
        }
        tw.print();
    })
}
