//! 从DICOM文件读取影像尺寸

use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject};
use std::path::Path;
use tracing::{debug, error, info};
use viewer_core::{Result, ViewerError};

/// 读取 Rows / Columns，返回 `(宽, 高)`
pub fn image_dimensions(path: &Path) -> Result<(u32, u32)> {
    let obj = open_file(path).map_err(|e| {
        error!("DICOM文件解析失败: {:?}", e);
        ViewerError::Dicom(format!("Failed to open DICOM file {}: {}", path.display(), e))
    })?;

    let rows = integer_element(&obj, tags::ROWS).ok_or_else(|| {
        ViewerError::Dicom(format!("DICOM file {} has no usable Rows", path.display()))
    })?;
    let columns = integer_element(&obj, tags::COLUMNS).ok_or_else(|| {
        ViewerError::Dicom(format!("DICOM file {} has no usable Columns", path.display()))
    })?;

    info!("DICOM frame {}: {}x{}", path.display(), columns, rows);
    Ok((columns, rows))
}

fn integer_element(obj: &DefaultDicomObject, tag: Tag) -> Option<u32> {
    let element = obj.element(tag).ok()?;
    match element.to_int::<u32>() {
        Ok(value) if value > 0 => Some(value),
        Ok(_) => None,
        Err(e) => {
            debug!("Tag {:?} is not an integer: {}", tag, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_a_dicom_error() {
        let err = image_dimensions(Path::new("/nonexistent/frame.dcm")).unwrap_err();
        assert!(matches!(err, ViewerError::Dicom(_)));
        assert!(err.to_string().contains("Failed to open DICOM file"));
    }
}
