/*!
Parameter files.

Free parameters are stored as the raw elements of each tensor in its storage order, one
tensor after the other, with no header. A stream is only valid if its length is exactly the
total size of the parameters.
*/
use crate::{
    error::{Error, Result},
    scalar::Scalar,
    solver::SharedParameter,
};
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    mem::size_of,
    path::Path,
};

/// Writes the values of `parameters` in order.
pub(crate) fn write_parameters<T: Scalar>(
    writer: &mut dyn Write,
    parameters: &[SharedParameter<T>],
) -> io::Result<()> {
    for parameter in parameters {
        let mut parameter = parameter.lock();
        let value = parameter.value_mut().host();
        writer.write_all(bytemuck::cast_slice(value.as_slice()))?;
    }
    Ok(())
}

/// Reads the values of `parameters` in order.
///
/// The parameters are only modified once the stream is known to match them.
pub(crate) fn read_parameters<T: Scalar>(
    reader: &mut dyn Read,
    source: &Path,
    parameters: &[SharedParameter<T>],
) -> Result<()> {
    let sizes: Vec<usize> = parameters
        .iter()
        .map(|p| p.lock().value().size() * size_of::<T>())
        .collect();
    let expected: usize = sizes.iter().sum();
    let mut bytes = Vec::with_capacity(expected);
    (&mut *reader)
        .take(expected as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| Error::io(source, e))?;
    if bytes.len() < expected {
        return Err(Error::corrupt(
            source,
            format!(
                "unexpected end of stream after {} of {expected} bytes",
                bytes.len()
            ),
        ));
    }
    let mut byte = [0u8; 1];
    let trailing = loop {
        match reader.read(&mut byte) {
            Ok(n) => break n > 0,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io(source, e)),
        }
    };
    if trailing {
        return Err(Error::corrupt(
            source,
            format!("unread bytes after {expected} bytes"),
        ));
    }
    let mut offset = 0;
    for (parameter, size) in parameters.iter().zip(sizes) {
        let mut parameter = parameter.lock();
        let value = parameter.value_mut().host_discard().as_mut_slice();
        bytemuck::cast_slice_mut::<T, u8>(value).copy_from_slice(&bytes[offset..offset + size]);
        offset += size;
    }
    tracing::trace!(path = %source.display(), bytes = expected, "read parameters");
    Ok(())
}

/// Creates the file at `path` and writes it with `f`.
pub(crate) fn save_file(
    path: &Path,
    f: impl FnOnce(&mut dyn Write) -> Result<()>,
) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);
    f(&mut writer)?;
    writer.flush().map_err(|e| Error::io(path, e))
}

/// Opens the file at `path`, or `None` if it does not exist and `ignore_not_exists`.
pub(crate) fn open_file(
    path: &Path,
    ignore_not_exists: bool,
) -> Result<Option<BufReader<File>>> {
    match File::open(path) {
        Ok(file) => Ok(Some(BufReader::new(file))),
        Err(e) if ignore_not_exists && e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{solver::Parameter, tensor::Tensor};

    fn parameters() -> Result<Vec<SharedParameter<f32>>> {
        Ok(vec![
            Parameter::new("a", Tensor::from_vec([2, 2], vec![1., 2., 3., 4.])?, None).into_shared(),
            Parameter::new("a", Tensor::from_vec([3], vec![5., 6., 7.])?, None).into_shared(),
        ])
    }

    #[test]
    fn parameters_round_trip() -> Result<()> {
        let saved = parameters()?;
        let mut bytes = Vec::new();
        write_parameters(&mut bytes, &saved).map_err(|e| Error::io("memory", e))?;
        assert_eq!(bytes.len(), 7 * 4);
        let loaded = parameters()?;
        for p in loaded.iter() {
            p.lock().value_mut().host_mut().fill(0.);
        }
        read_parameters(&mut bytes.as_slice(), Path::new("memory"), &loaded)?;
        assert_eq!(
            loaded[1].lock().value_mut().host().as_slice(),
            &[5., 6., 7.]
        );
        Ok(())
    }

    #[test]
    fn short_or_long_streams_are_corrupt() -> Result<()> {
        let params = parameters()?;
        let mut bytes = Vec::new();
        write_parameters(&mut bytes, &params).map_err(|e| Error::io("memory", e))?;
        let short = &bytes[..bytes.len() - 1];
        let result = read_parameters(&mut &short[..], Path::new("short"), &params);
        assert!(matches!(result, Err(Error::ParameterFileCorrupt { .. })));
        bytes.push(0);
        let result = read_parameters(&mut bytes.as_slice(), Path::new("long"), &params);
        assert!(matches!(result, Err(Error::ParameterFileCorrupt { .. })));
        assert_eq!(params[0].lock().value_mut().host().as_slice(), &[1., 2., 3., 4.]);
        Ok(())
    }

    #[test]
    fn unbounded_streams_are_corrupt() -> Result<()> {
        let params = parameters()?;
        let result = read_parameters(&mut io::repeat(1), Path::new("repeat"), &params);
        assert!(matches!(result, Err(Error::ParameterFileCorrupt { .. })));
        assert_eq!(params[1].lock().value_mut().host().as_slice(), &[5., 6., 7.]);
        Ok(())
    }

    #[test]
    fn missing_files() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let path = dir.path().join("missing.syn");
        assert!(open_file(&path, true)?.is_none());
        assert!(matches!(open_file(&path, false), Err(Error::Io { .. })));
        Ok(())
    }
}
