/*
 * resolver.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Resolving variable references to definitions.

use crate::context::CompileContext;
use crate::definition::{Definition, NormalDefinition};
use crate::error::{Error, ErrorKind, Result};
use crate::processor::{DefineCall, ProcessorRegistry};
use crate::variable::VariableRef;

/// A definition ready to be read from its first byte.
pub enum Resolved {
    /// A `#define`d value. Its bytes are scanned again for variables.
    Normal(NormalDefinition),
    /// A processor-provided value, emitted as-is.
    Processor(Box<dyn Definition>),
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolved::Normal(d) => f.debug_tuple("Normal").field(&d.full_name()).finish(),
            Resolved::Processor(_) => f.write_str("Processor(..)"),
        }
    }
}

/// Resolve `reference` against the request's definitions or the processors.
///
/// Resolution failures ([`ErrorKind::NoProcessor`],
/// [`ErrorKind::NotDefinedInProcessor`], [`ErrorKind::NotDefined`]) are
/// returned like any other error; the streaming reader decides to degrade
/// them to literal text.
pub fn resolve(
    reference: &VariableRef,
    ctx: &mut CompileContext,
    processors: &ProcessorRegistry,
) -> Result<Resolved> {
    let Some((processor_name, variable_name)) = &reference.processor else {
        let mut definition = ctx
            .definitions()
            .get(&reference.full_name)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotDefined).with_subject(reference.full_name.clone()))?;
        reset(&mut definition, reference)?;
        return Ok(Resolved::Normal(definition));
    };

    let handle = processors.find_processor(processor_name).ok_or_else(|| {
        Error::new(ErrorKind::NoProcessor).with_subject(reference.full_name.clone())
    })?;
    let variable = handle.info().variable(variable_name).ok_or_else(|| {
        Error::new(ErrorKind::NotDefinedInProcessor).with_subject(reference.full_name.clone())
    })?;

    let inputs = ctx.bind_inputs(variable.inputs.iter().map(|p| p.name.as_str()));
    let mut streams = Vec::new();
    for proto in &variable.stream_inputs {
        if let Some(stream) = ctx.take_stream(&proto.name, &reference.full_name)? {
            streams.push((proto.name.clone(), stream));
        }
    }

    let request = ctx.request(processor_name);
    tracing::debug!(
        variable = %reference.full_name,
        inputs = inputs.len(),
        streams = streams.len(),
        "defining processor variable"
    );
    let call = DefineCall {
        request: &request,
        variable,
        inputs,
        streams,
    };
    let mut definition = handle.processor().define_variable(call).map_err(|e| {
        Error::new(ErrorKind::DefineVariable).with_subject(format!("{}: {e}", reference.full_name))
    })?;
    reset(definition.as_mut(), reference)?;
    Ok(Resolved::Processor(definition))
}

fn reset(definition: &mut dyn Definition, reference: &VariableRef) -> Result<()> {
    definition.reset().map_err(|e| {
        Error::new(ErrorKind::ResetVariable)
            .with_subject(reference.full_name.clone())
            .because(e)
    })
}
