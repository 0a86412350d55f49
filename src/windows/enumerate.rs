//! Port enumeration and hardware metadata lookup.
//!
//! This is an independent read path consulted before opening a port;
//! no session operation calls into it. Port names come from the
//! `HARDWARE\DEVICEMAP\SERIALCOMM` registry key, per-port hardware
//! metadata from a SetupAPI walk over the Ports and Modem device
//! classes.

use std::ffi::CString;
use std::ptr;

use winapi::shared::devpropdef::{DEVPROPKEY, DEVPROPTYPE};
use winapi::shared::guiddef::GUID;
use winapi::shared::minwindef::{DWORD, HKEY};
use winapi::shared::ntdef::ULONG;
use winapi::shared::winerror::{ERROR_FILE_NOT_FOUND, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS};
use winapi::um::cfgmgr32::{CM_Get_Device_IDW, CM_Get_Parent, CR_SUCCESS};
use winapi::um::cguid::GUID_NULL;
use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::setupapi::{
    SetupDiClassGuidsFromNameA, SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInfo,
    SetupDiGetClassDevsA, SetupDiGetDeviceInstanceIdA, SetupDiGetDevicePropertyW,
    SetupDiGetDeviceRegistryPropertyA, SetupDiOpenDevRegKey, DICS_FLAG_GLOBAL, DIGCF_PRESENT,
    DIREG_DEV, SPDRP_DEVICEDESC, SPDRP_HARDWAREID, SPDRP_MFG, SP_DEVINFO_DATA,
};
use winapi::um::winnt::KEY_READ;
use winapi::um::winreg::{
    RegCloseKey, RegEnumValueW, RegOpenKeyExW, RegQueryValueExA, HKEY_LOCAL_MACHINE,
};

use crate::windows::error::get_win_error;
use crate::{hwid, return_win_op, PortProperties, SerialError, SerialResult};

const BUFFER_LEN: usize = 500;
const MAX_DEVICE_ID_LEN: usize = 200;

// DEVPKEY_Device_BusReportedDeviceDesc
const BUS_REPORTED_DEVICE_DESC: DEVPROPKEY = DEVPROPKEY {
    fmtid: GUID {
        Data1: 0x540b947e,
        Data2: 0x8b40,
        Data3: 0x45bc,
        Data4: [0xa8, 0xa2, 0x92, 0xae, 0x84, 0x6b, 0x1a, 0x0f],
    },
    pid: 4,
};

/// Lists the logical names of the serial ports currently known to the
/// system, in registry order. A machine without serial devices yields
/// an empty list, not an error.
pub fn list_port_names() -> SerialResult<Vec<String>> {
    let mut sub_key: Vec<u16> = "HARDWARE\\DEVICEMAP\\SERIALCOMM".encode_utf16().collect();
    sub_key.push(0);

    let mut key: HKEY = ptr::null_mut();
    let open_res = unsafe {
        RegOpenKeyExW(HKEY_LOCAL_MACHINE, sub_key.as_ptr(), 0, KEY_READ, &mut key)
    } as DWORD;
    if open_res == ERROR_FILE_NOT_FOUND {
        return Ok(Vec::new());
    }
    if open_res != ERROR_SUCCESS {
        return Err(SerialError::OsError {
            code: open_res,
            desc: "could not open the SERIALCOMM registry key".to_string(),
        });
    }

    let mut names = Vec::new();
    let mut index: DWORD = 0;
    loop {
        let mut value_name = [0u16; 256];
        let mut value_name_len = value_name.len() as DWORD;
        let mut data = [0u16; 256];
        let mut data_len = (data.len() * 2) as DWORD;
        let res = unsafe {
            RegEnumValueW(
                key,
                index,
                value_name.as_mut_ptr(),
                &mut value_name_len,
                ptr::null_mut(),
                ptr::null_mut(),
                data.as_mut_ptr() as *mut u8,
                &mut data_len,
            )
        } as DWORD;
        if res == ERROR_NO_MORE_ITEMS {
            break;
        }
        if res != ERROR_SUCCESS {
            break;
        }
        let chars = (data_len as usize / 2).min(data.len());
        let end = data[..chars].iter().position(|&c| c == 0).unwrap_or(chars);
        names.push(String::from_utf16_lossy(&data[..end]));
        index += 1;
    }
    unsafe { RegCloseKey(key) };
    Ok(names)
}

/// Looks up hardware identification metadata for the port with the
/// given logical name.
///
/// Every field of the result defaults to zero/empty when the
/// corresponding information cannot be discovered; a name that does
/// not match any present device yields an all-default result.
pub fn port_properties(port_name: &str) -> SerialResult<PortProperties> {
    let mut props = PortProperties::default();
    for guid in device_class_guids()? {
        if lookup_in_class(guid, port_name, &mut props)? {
            break;
        }
    }
    Ok(props)
}

/// Class GUIDs for serial-capable devices (COM ports plus modems)
fn device_class_guids() -> SerialResult<Vec<GUID>> {
    let mut guids = Vec::new();
    for class in ["Ports", "Modem"] {
        let class_name = CString::new(class).unwrap();
        let mut num_guids: DWORD = 0;
        let mut class_guids = vec![GUID_NULL];
        return_win_op!(SetupDiClassGuidsFromNameA(
            class_name.as_ptr(),
            class_guids.as_mut_ptr(),
            class_guids.len() as DWORD,
            &mut num_guids
        ))?;
        if num_guids == 0 {
            class_guids.pop();
        }
        guids.append(&mut class_guids);
    }
    Ok(guids)
}

/// Walks one device class looking for the port; fills `props` and
/// returns true when found
fn lookup_in_class(mut guid: GUID, port_name: &str, props: &mut PortProperties) -> SerialResult<bool> {
    let dev_info_set = unsafe {
        SetupDiGetClassDevsA(&mut guid, ptr::null_mut(), ptr::null_mut(), DIGCF_PRESENT)
    };
    if dev_info_set == INVALID_HANDLE_VALUE {
        return Err(get_win_error());
    }

    let mut dev_info: SP_DEVINFO_DATA = unsafe { std::mem::zeroed() };
    dev_info.cbSize = std::mem::size_of::<SP_DEVINFO_DATA>() as u32;

    let mut found = false;
    let mut idx = 0;
    while unsafe { SetupDiEnumDeviceInfo(dev_info_set, idx, &mut dev_info) } != 0 {
        idx += 1;

        let name = device_port_name(dev_info_set, &mut dev_info);
        // Parallel ports live in the same device class
        if name.is_empty() || name.starts_with("LPT") || name != port_name {
            continue;
        }

        let instance_id = device_instance_id(dev_info_set, &mut dev_info);
        props.vendor_id = hwid::vendor_id(&instance_id).unwrap_or(0);
        props.product_id = hwid::product_id(&instance_id).unwrap_or(0);
        props.serial_number = device_serial_number(instance_id, dev_info.DevInst);
        props.manufacturer = registry_property(dev_info_set, &mut dev_info, SPDRP_MFG);
        props.description = registry_property(dev_info_set, &mut dev_info, SPDRP_DEVICEDESC);
        props.bus_description = bus_provided_description(dev_info_set, &mut dev_info);
        found = true;
        break;
    }
    unsafe { SetupDiDestroyDeviceInfoList(dev_info_set) };
    Ok(found)
}

/// Reads the `PortName` registry value of one enumerated device
fn device_port_name(
    dev_info_set: winapi::um::setupapi::HDEVINFO,
    dev_info: &mut SP_DEVINFO_DATA,
) -> String {
    let hkey = unsafe {
        SetupDiOpenDevRegKey(
            dev_info_set,
            dev_info,
            DICS_FLAG_GLOBAL,
            0,
            DIREG_DEV,
            KEY_READ,
        )
    };
    if hkey as *mut winapi::ctypes::c_void == INVALID_HANDLE_VALUE {
        return String::new();
    }
    let mut buffer = [0u8; BUFFER_LEN];
    let mut len = BUFFER_LEN as ULONG;
    let value_name = CString::new("PortName").unwrap();
    let res = unsafe {
        RegQueryValueExA(
            hkey,
            value_name.as_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            buffer.as_mut_ptr(),
            &mut len,
        )
    } as DWORD;
    unsafe { RegCloseKey(hkey) };
    if res != ERROR_SUCCESS {
        return String::new();
    }
    trimmed_string(&buffer[..len as usize])
}

/// Device instance identifier, falling back to the hardware-ID
/// registry property when the instance id cannot be read
fn device_instance_id(
    dev_info_set: winapi::um::setupapi::HDEVINFO,
    dev_info: &mut SP_DEVINFO_DATA,
) -> String {
    let mut buffer = [0u8; BUFFER_LEN];
    if unsafe {
        SetupDiGetDeviceInstanceIdA(
            dev_info_set,
            dev_info,
            buffer.as_mut_ptr() as *mut i8,
            (BUFFER_LEN - 1) as DWORD,
            ptr::null_mut(),
        )
    } != 0
    {
        return trimmed_string(&buffer);
    }
    registry_property(dev_info_set, dev_info, SPDRP_HARDWAREID)
}

fn registry_property(
    dev_info_set: winapi::um::setupapi::HDEVINFO,
    dev_info: &mut SP_DEVINFO_DATA,
    property: DWORD,
) -> String {
    let mut buffer = [0u8; BUFFER_LEN];
    if unsafe {
        SetupDiGetDeviceRegistryPropertyA(
            dev_info_set,
            dev_info,
            property,
            ptr::null_mut(),
            buffer.as_mut_ptr(),
            (BUFFER_LEN - 1) as DWORD,
            ptr::null_mut(),
        )
    } == 0
    {
        return String::new();
    }
    trimmed_string(&buffer)
}

/// Description reported by the bus driver, where the driver provides
/// one (USB devices usually do)
fn bus_provided_description(
    dev_info_set: winapi::um::setupapi::HDEVINFO,
    dev_info: &mut SP_DEVINFO_DATA,
) -> String {
    let mut buffer = [0u16; BUFFER_LEN];
    let mut prop_type: DEVPROPTYPE = 0;
    if unsafe {
        SetupDiGetDevicePropertyW(
            dev_info_set,
            dev_info,
            &BUS_REPORTED_DEVICE_DESC,
            &mut prop_type,
            buffer.as_mut_ptr() as *mut u8,
            (buffer.len() * 2) as DWORD,
            ptr::null_mut(),
            0,
        )
    } == 0
    {
        return String::new();
    }
    let end = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..end])
}

/// Serial number for a device, walking up the parent chain until a
/// node whose instance path carries one is found (USB composite
/// functions report their serial on the parent node)
fn device_serial_number(mut instance_id: String, mut dev_inst: DWORD) -> String {
    loop {
        if let Some(serial) = hwid::serial_number(&instance_id) {
            return serial.to_string();
        }
        let mut parent: DWORD = 0;
        if unsafe { CM_Get_Parent(&mut parent, dev_inst, 0) } != CR_SUCCESS {
            return String::new();
        }
        dev_inst = parent;
        instance_id = match instance_id_of(dev_inst) {
            Some(id) => id,
            None => return String::new(),
        };
    }
}

fn instance_id_of(dev_inst: DWORD) -> Option<String> {
    let mut buffer = [0u16; MAX_DEVICE_ID_LEN + 1];
    if unsafe { CM_Get_Device_IDW(dev_inst, buffer.as_mut_ptr(), MAX_DEVICE_ID_LEN as ULONG, 0) }
        != CR_SUCCESS
    {
        return None;
    }
    let end = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    Some(String::from_utf16_lossy(&buffer[..end]))
}

fn trimmed_string(buffer: &[u8]) -> String {
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).to_string()
}
