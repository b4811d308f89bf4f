use std::path::Path;

use dotweave::signature::{BinaryMethod, BinaryType, StructuralMethod, StructuralType};
use serde::Serialize;

use crate::{app::GlobalOptions, commands::common::load_module, output::print_output};

#[derive(Debug, Serialize)]
struct TypeEntry {
    signature: String,
    methods: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SignaturesOutput {
    assembly: String,
    types: Vec<TypeEntry>,
}

pub fn run(path: &Path, type_filter: Option<&str>, opts: &GlobalOptions) -> anyhow::Result<()> {
    let module = load_module(path)?;

    let mut types = Vec::new();
    // Index 0 is <Module>
    for (index, ty) in module.types.iter().enumerate().skip(1) {
        let signature = BinaryType::new(&module, index).signature()?;
        if let Some(filter) = type_filter {
            if !signature.contains(filter) {
                continue;
            }
        }
        let methods = module
            .method_ids()
            .filter(|id| id.ty == index)
            .map(|id| BinaryMethod::new(&module, id).signature())
            .collect::<dotweave::Result<Vec<_>>>()?;
        log::debug!("{signature}: {} of {} method(s)", methods.len(), ty.methods.len());
        types.push(TypeEntry { signature, methods });
    }

    let output = SignaturesOutput {
        assembly: module.name.clone(),
        types,
    };
    print_output(&output, opts, |out| {
        for ty in &out.types {
            println!("{}", ty.signature);
            for method in &ty.methods {
                println!("  {method}");
            }
        }
    })
}
